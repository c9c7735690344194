//! Get-or-create registry of GPU contexts keyed by resource scope

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use crate::backend::hip_backend::device::DeviceRegistry;
use crate::config::StromConfig;
use crate::context::gpu_context::{GpuContext, ResourceScope};
use crate::error::{StromError, StromResult};

#[derive(Debug)]
struct RegistryShared {
    devices: Arc<DeviceRegistry>,
    config: StromConfig,
    /// Most recently used first
    contexts: Mutex<VecDeque<Arc<GpuContext>>>,
}

impl RegistryShared {
    fn put(&self, context: &Arc<GpuContext>) {
        let remaining = {
            let mut contexts = match self.contexts.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let remaining = context.put();
            if remaining == 0 {
                contexts.retain(|c| !Arc::ptr_eq(c, context));
            }
            remaining
        };
        tracing::trace!(scope = %context.scope(), refcnt = remaining, "put GPU context");
        if remaining == 0 {
            context.teardown();
        }
    }
}

/// Process-level pool of [`GpuContext`]s
///
/// Cloning is cheap and shares the pool.
#[derive(Debug, Clone)]
pub struct ContextRegistry {
    shared: Arc<RegistryShared>,
}

impl ContextRegistry {
    /// Empty pool over `devices`; `config` is validated here
    pub fn new(devices: Arc<DeviceRegistry>, config: StromConfig) -> StromResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(RegistryShared {
                devices,
                config,
                contexts: Mutex::new(VecDeque::new()),
            }),
        })
    }

    /// Context for `scope`, created on first use
    ///
    /// Each call takes one reference; give it back with
    /// [`GpuContextRef::release`] or by dropping the handle.
    pub fn acquire(&self, scope: ResourceScope) -> StromResult<GpuContextRef> {
        let mut contexts = self.shared.contexts.lock()?;
        if let Some(pos) = contexts.iter().position(|c| c.scope() == scope) {
            let context = contexts.remove(pos).ok_or_else(|| {
                StromError::Internal(format!("context list changed under lock for {}", scope))
            })?;
            let refcnt = context.get();
            contexts.push_front(Arc::clone(&context));
            tracing::trace!(%scope, refcnt, "get GPU context");
            return Ok(GpuContextRef::new(context, Arc::clone(&self.shared)));
        }

        let context = Arc::new(GpuContext::create(
            Arc::clone(&self.shared.devices),
            &self.shared.config,
            scope,
        )?);
        context.get();
        contexts.push_front(Arc::clone(&context));
        Ok(GpuContextRef::new(context, Arc::clone(&self.shared)))
    }

    /// Resource-scope teardown hook
    ///
    /// Tears down the scope's context regardless of its reference count.
    /// On commit a live context means some caller forgot to release it.
    /// Returns whether a context existed.
    pub fn release_scope(&self, scope: ResourceScope, is_commit: bool) -> bool {
        let found = {
            let mut contexts = match self.shared.contexts.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            contexts
                .iter()
                .position(|c| c.scope() == scope)
                .and_then(|pos| contexts.remove(pos))
        };
        match found {
            Some(context) => {
                if is_commit {
                    tracing::warn!(
                        %scope,
                        refcnt = context.refcount(),
                        "someone forgot to put GPU context"
                    );
                }
                context.teardown();
                true
            }
            None => false,
        }
    }

    /// Number of live contexts
    pub fn len(&self) -> usize {
        self.shared.contexts.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scopes with a live context, most recently used first
    pub fn scopes(&self) -> StromResult<Vec<ResourceScope>> {
        Ok(self.shared.contexts.lock()?.iter().map(|c| c.scope()).collect())
    }

    pub fn device_registry(&self) -> &Arc<DeviceRegistry> {
        &self.shared.devices
    }
}

/// Counted reference to a [`GpuContext`]
///
/// Cloning takes another reference. Dropping the handle releases it.
#[derive(Debug)]
pub struct GpuContextRef {
    context: Arc<GpuContext>,
    shared: Arc<RegistryShared>,
    released: bool,
}

impl GpuContextRef {
    fn new(context: Arc<GpuContext>, shared: Arc<RegistryShared>) -> Self {
        Self {
            context,
            shared,
            released: false,
        }
    }

    /// Give the reference back; the last one tears the context down
    ///
    /// Not reentrant: do not release from inside a data store's `release`.
    pub fn release(mut self) {
        self.put_once();
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    fn put_once(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.put(&self.context);
        }
    }
}

impl Deref for GpuContextRef {
    type Target = GpuContext;

    fn deref(&self) -> &GpuContext {
        &self.context
    }
}

impl Clone for GpuContextRef {
    fn clone(&self) -> Self {
        self.context.get();
        Self::new(Arc::clone(&self.context), Arc::clone(&self.shared))
    }
}

impl Drop for GpuContextRef {
    fn drop(&mut self) {
        self.put_once();
    }
}
