//! GPU context pool
//!
//! A [`GpuContext`] groups one driver context and one [`MemoryHead`] per
//! device, a pinned host scratch arena and the data stores allocated under
//! it. Contexts are shared by every task issued within one resource scope
//! and are reference counted:
//!
//! ```text
//! ContextRegistry::acquire(scope) ──► GpuContextRef (refcnt + 1)
//!                                          │
//!                   release()/drop  ◄──────┘ (refcnt - 1, teardown at 0)
//! ```
//!
//! [`MemoryHead`]: crate::memory::MemoryHead

pub mod data_store;
pub mod gpu_context;
pub mod registry;

pub use data_store::{DataStore, DataStoreId};
pub use gpu_context::{DeviceContext, GpuContext, ResourceScope};
pub use registry::{ContextRegistry, GpuContextRef};
