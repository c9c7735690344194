//! Wake-up latch for the consumer's wait step
//!
//! Completion notifications arrive on driver threads and bump the latch
//! generation. The consumer samples the generation *before* inspecting its
//! queues and waits only while it is unchanged, so a notification that
//! lands between the check and the wait is never lost.
//!
//! One latch is shared process-wide by default (see [`process_latch`]).
//! Interrupting it aborts the current wait with
//! [`StromError::Cancelled`](crate::error::StromError::Cancelled).

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

#[derive(Debug, Default)]
struct LatchState {
    generation: u64,
    interrupted: bool,
}

/// Generation-counting latch with an interrupt flag
#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

static PROCESS_LATCH: Lazy<Arc<Latch>> = Lazy::new(|| Arc::new(Latch::new()));

/// Latch shared by every task state that does not install its own
pub fn process_latch() -> Arc<Latch> {
    Arc::clone(&PROCESS_LATCH)
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LatchState> {
        // Notifiers run on driver threads and must never fail.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Wake every waiter
    pub fn set(&self) {
        let mut state = self.lock();
        state.generation = state.generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Block until the generation moves past `seen`, an interrupt arrives or
    /// `timeout` elapses
    ///
    /// Returns `false` on timeout.
    pub fn wait(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.generation != seen || state.interrupted {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Ask the waiting consumer to abort
    pub fn interrupt(&self) {
        self.lock().interrupted = true;
        self.cond.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.lock().interrupted
    }

    /// Clear a pending interrupt; returns whether one was pending
    pub fn take_interrupt(&self) -> bool {
        std::mem::take(&mut self.lock().interrupted)
    }
}
