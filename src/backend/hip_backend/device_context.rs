//! Per-thread device context management
//!
//! **CRITICAL:** the current context is PER-THREAD, not global.
//! - A push only affects the calling thread's context stack
//! - Device memory is attributed to whichever context is current
//! - Pushing one context while another is active, without a matching pop,
//!   attributes allocations to the wrong device
//!
//! [`ContextGuard`] pairs every push with a pop. A thread-local depth counter
//! mirrors the driver's stack so that callers can assert a context is active
//! before touching device memory.

use std::cell::Cell;
use std::thread_local;

use crate::backend::hip_backend::error::HipResult;
use crate::backend::hip_backend::runtime::{ContextHandle, DeviceRuntime};

thread_local! {
    static PUSH_DEPTH: Cell<usize> = const { Cell::new(0) };
    static TOP_CONTEXT: Cell<Option<ContextHandle>> = const { Cell::new(None) };
}

/// Number of contexts pushed through [`ContextGuard`] on this thread
pub fn context_depth() -> usize {
    PUSH_DEPTH.with(|d| d.get())
}

/// Context most recently pushed through [`ContextGuard`] on this thread
pub fn current_context() -> Option<ContextHandle> {
    TOP_CONTEXT.with(|c| c.get())
}

/// Check that `expected` is the innermost pushed context
pub fn verify_context(expected: ContextHandle) -> bool {
    current_context() == Some(expected)
}

/// Makes a context current for the lifetime of the guard
///
/// Dropping the guard pops the context and restores the previous top. A pop
/// failure on drop is logged; it cannot be propagated from `Drop`.
#[must_use = "the context is popped as soon as the guard is dropped"]
pub struct ContextGuard<'a> {
    runtime: &'a dyn DeviceRuntime,
    context: ContextHandle,
    previous: Option<ContextHandle>,
    popped: bool,
}

impl<'a> ContextGuard<'a> {
    /// Push `context` on the calling thread
    pub fn push(runtime: &'a dyn DeviceRuntime, context: ContextHandle) -> HipResult<Self> {
        runtime.ctx_push_current(context)?;
        let previous = TOP_CONTEXT.with(|c| c.replace(Some(context)));
        PUSH_DEPTH.with(|d| d.set(d.get() + 1));
        tracing::trace!(?context, depth = context_depth(), "pushed device context");
        Ok(Self {
            runtime,
            context,
            previous,
            popped: false,
        })
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// Pop explicitly and report a driver failure
    pub fn pop(mut self) -> HipResult<()> {
        self.pop_inner()
    }

    fn pop_inner(&mut self) -> HipResult<()> {
        if self.popped {
            return Ok(());
        }
        self.popped = true;
        TOP_CONTEXT.with(|c| c.set(self.previous));
        PUSH_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
        self.runtime.ctx_pop_current().map(|_| ())
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pop_inner() {
            tracing::warn!(context = ?self.context, "failed to pop device context: {}", e);
        }
    }
}

/// Run `f` with `context` current, popping afterwards even if `f` fails
pub fn with_context<T>(
    runtime: &dyn DeviceRuntime,
    context: ContextHandle,
    f: impl FnOnce(&dyn DeviceRuntime) -> T,
) -> HipResult<T> {
    let guard = ContextGuard::push(runtime, context)?;
    let out = f(runtime);
    guard.pop()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimRuntime;
    use std::sync::Arc;

    #[test]
    fn test_guard_restores_previous_context() {
        let sim = SimRuntime::builder().devices(2).build();
        let a = sim.ctx_create(0).unwrap();
        let b = sim.ctx_create(1).unwrap();

        assert_eq!(current_context(), None);
        {
            let _outer = ContextGuard::push(&sim, a).unwrap();
            assert!(verify_context(a));
            {
                let _inner = ContextGuard::push(&sim, b).unwrap();
                assert!(verify_context(b));
                assert_eq!(context_depth(), 2);
            }
            assert!(verify_context(a));
            assert_eq!(sim.current_context(), Some(a));
        }
        assert_eq!(context_depth(), 0);
        assert_eq!(sim.current_context(), None);
    }

    #[test]
    fn test_with_context_pops_on_return() {
        let sim: Arc<SimRuntime> = Arc::new(SimRuntime::builder().devices(1).build());
        let ctx = sim.ctx_create(0).unwrap();
        let ptr = with_context(sim.as_ref(), ctx, |rt| rt.mem_alloc(4096)).unwrap().unwrap();
        assert_eq!(context_depth(), 0);
        with_context(sim.as_ref(), ctx, |rt| rt.mem_free(ptr)).unwrap().unwrap();
        // A failing body still pops.
        let failed = with_context(sim.as_ref(), ctx, |rt| rt.mem_alloc(usize::MAX)).unwrap();
        assert!(failed.is_err());
        assert_eq!(context_depth(), 0);
        assert_eq!(sim.current_context(), None);
    }
}
