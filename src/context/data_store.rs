//! Data stores tracked by a GPU context
//!
//! Operators allocate result/staging stores under a context and normally
//! release them themselves. Whatever is still registered when the context
//! goes away is released during teardown.

use std::collections::BTreeMap;
use std::fmt;

use crate::context::gpu_context::GpuContext;

/// Identifier returned by [`GpuContext::register_data_store`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataStoreId(pub u64);

impl fmt::Display for DataStoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ds#{}", self.0)
    }
}

/// Resource owned by a data store
pub trait DataStore: Send + fmt::Debug {
    /// Label used in teardown warnings
    fn label(&self) -> &str;

    /// Free everything the store holds
    ///
    /// Called at most once, either by the owner or by context teardown.
    /// Device memory handed out by `context` is still valid here.
    fn release(self: Box<Self>, context: &GpuContext);
}

/// Registered stores, in registration order
#[derive(Debug, Default)]
pub(crate) struct DataStoreSet {
    next_id: u64,
    stores: BTreeMap<DataStoreId, Box<dyn DataStore>>,
}

impl DataStoreSet {
    pub(crate) fn insert(&mut self, store: Box<dyn DataStore>) -> DataStoreId {
        self.next_id += 1;
        let id = DataStoreId(self.next_id);
        self.stores.insert(id, store);
        id
    }

    pub(crate) fn remove(&mut self, id: DataStoreId) -> Option<Box<dyn DataStore>> {
        self.stores.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.stores.len()
    }

    pub(crate) fn drain(&mut self) -> Vec<(DataStoreId, Box<dyn DataStore>)> {
        std::mem::take(&mut self.stores).into_iter().collect()
    }
}
