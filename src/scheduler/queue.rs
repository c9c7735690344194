//! Task queues shared between the consumer and completion notifiers
//!
//! Only task metadata lives here. Payloads stay with the consumer so that
//! the lock is held for list manipulation only, never across a callback.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::backend::hip_backend::HipResult;
use crate::scheduler::latch::Latch;
use crate::scheduler::types::{TaskId, TaskLocation};

/// Snapshot of the queue lengths of one task state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub tracked: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub ready: usize,
}

impl QueueStats {
    /// Tasks counted against the concurrency ceiling
    pub fn in_flight(&self) -> usize {
        self.pending + self.running + self.completed + self.ready
    }

    pub fn is_empty(&self) -> bool {
        self.tracked == 0
    }
}

#[derive(Debug, Default)]
struct SlotMeta {
    generation: u32,
    location: Option<TaskLocation>,
    status: Option<HipResult<()>>,
}

/// Queue metadata of one task state
#[derive(Debug, Default)]
pub(crate) struct TaskQueues {
    slots: Vec<SlotMeta>,
    free_slots: Vec<usize>,
    pub(crate) pending: VecDeque<TaskId>,
    pub(crate) running: VecDeque<TaskId>,
    pub(crate) completed: VecDeque<TaskId>,
    pub(crate) ready: VecDeque<TaskId>,
    pub(crate) scan_done: bool,
}

impl TaskQueues {
    /// Start tracking a new task at `location`
    pub(crate) fn track(&mut self, location: TaskLocation) -> TaskId {
        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(SlotMeta::default());
                self.slots.len() - 1
            }
        };
        let meta = &mut self.slots[slot];
        meta.location = Some(location);
        meta.status = None;
        TaskId::new(slot, meta.generation)
    }

    /// Stop tracking `id`; returns false for a stale or unknown handle
    pub(crate) fn untrack(&mut self, id: TaskId) -> bool {
        if self.location(id).is_none() {
            return false;
        }
        self.unlink(id);
        let meta = &mut self.slots[id.slot()];
        meta.location = None;
        meta.status = None;
        meta.generation = meta.generation.wrapping_add(1);
        self.free_slots.push(id.slot());
        true
    }

    fn meta(&self, id: TaskId) -> Option<&SlotMeta> {
        self.slots
            .get(id.slot())
            .filter(|m| m.generation == id.generation() && m.location.is_some())
    }

    pub(crate) fn location(&self, id: TaskId) -> Option<TaskLocation> {
        self.meta(id).and_then(|m| m.location)
    }

    pub(crate) fn set_location(&mut self, id: TaskId, location: TaskLocation) {
        if self.location(id).is_some() {
            self.slots[id.slot()].location = Some(location);
        }
    }

    pub(crate) fn record_status(&mut self, id: TaskId, status: HipResult<()>) {
        if self.location(id).is_some() {
            self.slots[id.slot()].status = Some(status);
        }
    }

    pub(crate) fn take_status(&mut self, id: TaskId) -> Option<HipResult<()>> {
        if self.location(id).is_some() {
            self.slots[id.slot()].status.take()
        } else {
            None
        }
    }

    /// Remove `id` from whichever queue holds it
    pub(crate) fn unlink(&mut self, id: TaskId) {
        for queue in [
            &mut self.pending,
            &mut self.running,
            &mut self.completed,
            &mut self.ready,
        ] {
            queue.retain(|&t| t != id);
        }
    }

    /// Park a task whose callback failed; cleanup releases it
    pub(crate) fn park_failed(&mut self, id: TaskId) {
        self.unlink(id);
        self.set_location(id, TaskLocation::Failed);
    }

    /// Every tracked task in slot order
    pub(crate) fn tracked(&self) -> Vec<TaskId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, m)| m.location.is_some())
            .map(|(slot, m)| TaskId::new(slot, m.generation))
            .collect()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.pending.len() + self.running.len() + self.completed.len() + self.ready.len()
    }

    pub(crate) fn stats(&self) -> QueueStats {
        QueueStats {
            tracked: self.slots.iter().filter(|m| m.location.is_some()).count(),
            pending: self.pending.len(),
            running: self.running.len(),
            completed: self.completed.len(),
            ready: self.ready.len(),
        }
    }

    /// Forget every task; `scan_done` is left alone
    pub(crate) fn reset(&mut self) {
        for id in self.tracked() {
            self.untrack(id);
        }
        self.pending.clear();
        self.running.clear();
        self.completed.clear();
        self.ready.clear();
    }
}

/// State reachable from completion notifiers
#[derive(Debug)]
pub(crate) struct SharedQueues {
    queues: Mutex<TaskQueues>,
    pub(crate) latch: Arc<Latch>,
}

impl SharedQueues {
    pub(crate) fn new(latch: Arc<Latch>) -> Self {
        Self {
            queues: Mutex::new(TaskQueues::default()),
            latch,
        }
    }

    /// Lock the queues
    ///
    /// Notifiers cannot report a poisoned lock, and the queues stay
    /// consistent at every unlock, so poisoning is ignored here.
    pub(crate) fn lock(&self) -> MutexGuard<'_, TaskQueues> {
        self.queues.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_reused_with_new_generation() {
        let mut q = TaskQueues::default();
        let a = q.track(TaskLocation::Pending);
        q.pending.push_back(a);
        assert!(q.untrack(a));
        assert!(q.pending.is_empty());

        let b = q.track(TaskLocation::Pending);
        assert_eq!(a.slot(), b.slot());
        assert_ne!(a.generation(), b.generation());
        assert_eq!(q.location(a), None);
        assert!(!q.untrack(a));
    }

    #[test]
    fn test_stats_count_queues() {
        let mut q = TaskQueues::default();
        let a = q.track(TaskLocation::Pending);
        let b = q.track(TaskLocation::Running);
        let _c = q.track(TaskLocation::Fetched);
        q.pending.push_back(a);
        q.running.push_back(b);

        let stats = q.stats();
        assert_eq!(stats.tracked, 3);
        assert_eq!(stats.in_flight(), 2);
        q.reset();
        assert!(q.stats().is_empty());
    }
}
