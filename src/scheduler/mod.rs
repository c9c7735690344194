//! Asynchronous GPU task pipeline
//!
//! A task state pulls input chunks, launches them on device streams and
//! hands finished tasks back to the consumer. Tasks move between four
//! queues under one lock:
//!
//! ```text
//!  next_chunk --> pending --launch--> running --notify--> completed
//!                    ^                                        |
//!                    +------------- complete == false --------+
//!                                                             |
//!                        consumer <-- fetch <-- ready <-------+
//! ```
//!
//! The number of tasks in any queue is capped by `max_async_tasks`.

pub mod latch;
pub mod queue;
pub mod scheduler;
pub mod stats;
pub mod task;
pub mod types;

pub use latch::{process_latch, Latch};
pub use queue::QueueStats;
pub use scheduler::GpuTaskState;
pub use stats::PerfStats;
pub use task::{CompletionNotifier, GpuTask, LaunchContext, TaskOps};
pub use types::{TaskId, TaskLocation};
