//! Per-scope GPU context: one driver context and allocator per device

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::hip_backend::device::DeviceRegistry;
use crate::backend::hip_backend::device_context::{with_context, ContextGuard};
use crate::backend::hip_backend::runtime::{
    CachePreference, ContextHandle, DevicePtr, DeviceRuntime,
};
use crate::config::StromConfig;
use crate::context::data_store::{DataStore, DataStoreId, DataStoreSet};
use crate::error::{StromError, StromResult};
use crate::memory::{AllocatorStats, MemoryHead, ScratchArena, ScratchRegion};

/// Identity of the resource owner a context belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceScope(pub u64);

impl fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope:{}", self.0)
    }
}

/// One physical device within a [`GpuContext`]
#[derive(Debug)]
pub struct DeviceContext {
    index: usize,
    ordinal: i32,
    context: ContextHandle,
    memory: Mutex<MemoryHead>,
}

impl DeviceContext {
    /// Position within the owning context's device array
    pub fn index(&self) -> usize {
        self.index
    }

    /// Driver device ordinal
    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// Lock this device's allocator
    ///
    /// The device context must be current for `alloc`; prefer
    /// [`GpuContext::mem_alloc`] which takes care of that.
    pub fn memory(&self) -> StromResult<MutexGuard<'_, MemoryHead>> {
        Ok(self.memory.lock()?)
    }
}

/// Reference-counted set of device contexts shared by all tasks of one
/// resource scope
///
/// Created through [`ContextRegistry::acquire`](super::ContextRegistry::acquire).
/// Device 0's context is the primary one: the scratch arena is mapped
/// under it, so it is destroyed last.
pub struct GpuContext {
    scope: ResourceScope,
    registry: Arc<DeviceRegistry>,
    config: StromConfig,
    devices: Vec<DeviceContext>,
    scratch: Mutex<ScratchArena>,
    data_stores: Mutex<DataStoreSet>,
    refcnt: AtomicUsize,
    next_device: AtomicUsize,
    torn_down: AtomicBool,
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("scope", &self.scope)
            .field("devices", &self.devices.len())
            .field("refcnt", &self.refcnt.load(Ordering::Relaxed))
            .finish()
    }
}

impl GpuContext {
    /// Create one driver context and allocator per registered device
    ///
    /// If device `k` fails, contexts `[0, k)` are destroyed before the
    /// error is returned. The new context starts with a reference count of
    /// zero; the registry takes the first reference.
    pub(crate) fn create(
        registry: Arc<DeviceRegistry>,
        config: &StromConfig,
        scope: ResourceScope,
    ) -> StromResult<Self> {
        let runtime = Arc::clone(registry.runtime());
        let num_devices = registry.num_devices();
        if num_devices == 0 {
            return Err(StromError::NoDevices);
        }

        let mut devices: Vec<DeviceContext> = Vec::with_capacity(num_devices);
        for (index, dev) in registry.devices().iter().enumerate() {
            match Self::create_device_context(runtime.as_ref(), dev.ordinal) {
                Ok(context) => devices.push(DeviceContext {
                    index,
                    ordinal: dev.ordinal,
                    context,
                    memory: Mutex::new(MemoryHead::new(index, config, registry.max_alloc_size())),
                }),
                Err(e) => {
                    tracing::error!(
                        %scope,
                        device = dev.ordinal,
                        "failed to create device context: {}",
                        e
                    );
                    for created in devices.iter().rev() {
                        if let Err(e) = runtime.ctx_destroy(created.context) {
                            tracing::warn!(
                                device = created.ordinal,
                                "failed to destroy device context while unwinding: {}",
                                e
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        let next_device = std::process::id() as usize % num_devices;
        tracing::info!(%scope, devices = num_devices, "created GPU context");

        Ok(Self {
            scope,
            registry,
            config: config.clone(),
            devices,
            scratch: Mutex::new(ScratchArena::new(config.chunk_size)),
            data_stores: Mutex::new(DataStoreSet::default()),
            refcnt: AtomicUsize::new(0),
            next_device: AtomicUsize::new(next_device),
            torn_down: AtomicBool::new(false),
        })
    }

    fn create_device_context(runtime: &dyn DeviceRuntime, ordinal: i32) -> StromResult<ContextHandle> {
        let context = runtime.ctx_create(ordinal)?;
        let configured = with_context(runtime, context, |rt| {
            rt.ctx_set_cache_config(CachePreference::PreferShared)
        })
        .and_then(|r| r);
        if let Err(e) = configured {
            if let Err(destroy) = runtime.ctx_destroy(context) {
                tracing::warn!(device = ordinal, "failed to destroy device context: {}", destroy);
            }
            return Err(e.into());
        }
        Ok(context)
    }

    pub fn scope(&self) -> ResourceScope {
        self.scope
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        self.registry.runtime()
    }

    pub fn device_registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &StromConfig {
        &self.config
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[DeviceContext] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> StromResult<&DeviceContext> {
        self.devices.get(index).ok_or(StromError::DeviceIndexOutOfRange {
            index,
            count: self.devices.len(),
        })
    }

    /// Current reference count
    pub fn refcount(&self) -> usize {
        self.refcnt.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self) -> usize {
        self.refcnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference; returns the remaining count
    pub(crate) fn put(&self) -> usize {
        let prev = self
            .refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if prev == 0 {
            tracing::warn!(scope = %self.scope, "GPU context released more often than acquired");
        }
        prev.saturating_sub(1)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Pick the next device round-robin
    pub fn next_device_index(&self) -> usize {
        self.next_device.fetch_add(1, Ordering::Relaxed) % self.devices.len()
    }

    /// Allocate device memory on `index`
    ///
    /// Pushes the device's context for the duration of the call. `Ok(None)`
    /// means the device is out of memory right now.
    pub fn mem_alloc(&self, index: usize, bytes: usize) -> StromResult<Option<DevicePtr>> {
        let dev = self.device(index)?;
        let runtime = self.runtime().as_ref();
        let _guard = ContextGuard::push(runtime, dev.context)?;
        let mut head = dev.memory()?;
        head.alloc(runtime, bytes)
    }

    /// Release memory obtained from [`mem_alloc`](Self::mem_alloc)
    pub fn mem_free(&self, index: usize, addr: DevicePtr) -> StromResult<()> {
        let dev = self.device(index)?;
        let runtime = self.runtime().as_ref();
        let mut head = dev.memory()?;
        head.free(runtime, dev.context, addr)
    }

    pub fn allocator_stats(&self, index: usize) -> StromResult<AllocatorStats> {
        Ok(self.device(index)?.memory()?.stats())
    }

    /// Carve a pinned host staging region out of the scratch arena
    pub fn scratch_alloc(&self, bytes: usize) -> StromResult<ScratchRegion> {
        let primary = self.device(0)?.context;
        let runtime = self.runtime().as_ref();
        let _guard = ContextGuard::push(runtime, primary)?;
        self.scratch.lock()?.allocate(runtime, bytes)
    }

    pub fn scratch_free(&self, region: ScratchRegion) -> StromResult<()> {
        self.scratch.lock()?.free(region)
    }

    /// Bytes of pinned host memory currently mapped by the scratch arena
    pub fn scratch_capacity(&self) -> StromResult<usize> {
        Ok(self.scratch.lock()?.capacity())
    }

    /// Track `store` so that teardown releases it if its owner does not
    pub fn register_data_store(&self, store: Box<dyn DataStore>) -> StromResult<DataStoreId> {
        let id = self.data_stores.lock()?.insert(store);
        tracing::trace!(scope = %self.scope, %id, "registered data store");
        Ok(id)
    }

    /// Stop tracking `id` and hand the store back to its owner
    pub fn unregister_data_store(&self, id: DataStoreId) -> StromResult<Option<Box<dyn DataStore>>> {
        Ok(self.data_stores.lock()?.remove(id))
    }

    /// Unregister and release `id` in one step
    pub fn release_data_store(&self, id: DataStoreId) -> StromResult<bool> {
        match self.unregister_data_store(id)? {
            Some(store) => {
                store.release(self);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn data_store_count(&self) -> StromResult<usize> {
        Ok(self.data_stores.lock()?.len())
    }

    /// Wait for all work queued in every device context
    ///
    /// Failures are logged; used on cleanup paths.
    pub fn synchronize_devices(&self) {
        let runtime = self.runtime().as_ref();
        for dev in &self.devices {
            let synced = with_context(runtime, dev.context, |rt| rt.ctx_synchronize()).and_then(|r| r);
            if let Err(e) = synced {
                tracing::warn!(device = dev.ordinal, "failed to synchronize device context: {}", e);
            }
        }
    }

    /// Release everything this context owns
    ///
    /// Order matters: data stores may still free device memory, raw blocks
    /// are returned under their own context, and the primary context goes
    /// last because the scratch arena is mapped under it. Runs once; later
    /// calls are no-ops. Never fails; problems are logged.
    pub(crate) fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let runtime = self.runtime().as_ref();

        let stores = match self.data_stores.lock() {
            Ok(mut set) => set.drain(),
            Err(poisoned) => poisoned.into_inner().drain(),
        };
        for (id, store) in stores {
            tracing::warn!(
                scope = %self.scope,
                %id,
                store = store.label(),
                "data store still registered at context teardown"
            );
            store.release(self);
        }

        for dev in &self.devices {
            match dev.memory.lock() {
                Ok(mut head) => head.release_all(runtime, dev.context),
                Err(poisoned) => poisoned.into_inner().release_all(runtime, dev.context),
            }
        }

        for dev in self.devices.iter().skip(1).rev() {
            if let Err(e) = runtime.ctx_destroy(dev.context) {
                tracing::warn!(device = dev.ordinal, "failed to destroy device context: {}", e);
            }
        }

        if let Some(primary) = self.devices.first() {
            match ContextGuard::push(runtime, primary.context) {
                Ok(guard) => {
                    match self.scratch.lock() {
                        Ok(mut arena) => arena.release(runtime),
                        Err(poisoned) => poisoned.into_inner().release(runtime),
                    }
                    drop(guard);
                }
                Err(e) => tracing::warn!(
                    device = primary.ordinal,
                    "cannot push primary context to release scratch memory: {}",
                    e
                ),
            }
            if let Err(e) = runtime.ctx_destroy(primary.context) {
                tracing::warn!(device = primary.ordinal, "failed to destroy primary context: {}", e);
            }
        }

        tracing::info!(scope = %self.scope, "released GPU context");
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimRuntime;

    fn setup(devices: usize) -> (Arc<SimRuntime>, Arc<DeviceRegistry>) {
        let sim = Arc::new(SimRuntime::builder().devices(devices).build());
        let registry =
            DeviceRegistry::probe(Arc::clone(&sim) as Arc<dyn DeviceRuntime>, &StromConfig::default())
                .unwrap();
        (sim, Arc::new(registry))
    }

    #[test]
    fn test_create_prefers_shared_memory() {
        let (sim, registry) = setup(2);
        let ctx = GpuContext::create(registry, &StromConfig::default(), ResourceScope(1)).unwrap();
        for dev in ctx.devices() {
            assert_eq!(
                sim.cache_preference(dev.context()),
                Some(CachePreference::PreferShared)
            );
        }
        assert_eq!(sim.current_context(), None);
    }

    #[test]
    fn test_create_unwinds_on_failure() {
        let (sim, registry) = setup(3);
        sim.fail_context_create(2);
        let err = GpuContext::create(registry, &StromConfig::default(), ResourceScope(1)).unwrap_err();
        assert!(matches!(err, StromError::Hip(_)));
        let c = sim.counters();
        assert_eq!(c.contexts_created, 2);
        assert_eq!(c.contexts_destroyed, 2);
    }

    #[test]
    fn test_round_robin_cycles_devices() {
        let (_sim, registry) = setup(3);
        let ctx = GpuContext::create(registry, &StromConfig::default(), ResourceScope(1)).unwrap();
        let first = ctx.next_device_index();
        assert_eq!(ctx.next_device_index(), (first + 1) % 3);
        assert_eq!(ctx.next_device_index(), (first + 2) % 3);
    }

    #[test]
    fn test_mem_alloc_pushes_device_context() {
        let (sim, registry) = setup(2);
        let ctx = GpuContext::create(registry, &StromConfig::default(), ResourceScope(1)).unwrap();
        let ptr = ctx.mem_alloc(1, 4096).unwrap().unwrap();
        assert_eq!(sim.current_context(), None);
        assert_eq!(ctx.allocator_stats(1).unwrap().active_chunks, 1);
        ctx.mem_free(1, ptr).unwrap();
        assert_eq!(ctx.allocator_stats(1).unwrap().active_chunks, 0);
        assert!(matches!(
            ctx.mem_alloc(5, 1),
            Err(StromError::DeviceIndexOutOfRange { index: 5, count: 2 })
        ));
    }

    #[test]
    fn test_teardown_releases_everything_once() {
        let (sim, registry) = setup(2);
        let ctx = GpuContext::create(registry, &StromConfig::default(), ResourceScope(1)).unwrap();
        ctx.mem_alloc(0, 1 << 20).unwrap().unwrap();
        ctx.mem_alloc(1, 1 << 20).unwrap().unwrap();
        ctx.scratch_alloc(4096).unwrap();

        ctx.teardown();
        ctx.teardown();
        let c = sim.counters();
        assert_eq!(c.raw_frees, 2);
        assert_eq!(c.host_frees, 1);
        assert_eq!(c.contexts_destroyed, 2);
        assert_eq!(c.implicit_frees, 0);
        assert_eq!(c.unmapped_host_allocs, 0);
        assert!(ctx.is_torn_down());
        drop(ctx);
        assert_eq!(sim.counters().contexts_destroyed, 2);
    }
}
