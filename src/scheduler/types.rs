//! Core types for the task pipeline

use std::fmt;

/// Handle of a task within one [`GpuTaskState`](super::GpuTaskState)
///
/// Slots are reused; the generation tells a stale handle (for example a
/// late completion for a task that was already cleaned up) from the
/// current occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    slot: u32,
    generation: u32,
}

impl TaskId {
    pub(crate) fn new(slot: usize, generation: u32) -> Self {
        Self {
            slot: slot as u32,
            generation,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}.{}", self.slot, self.generation)
    }
}

/// Where a tracked task currently is
///
/// ```text
/// Pending ─► Launching ─► Running ─► Completed ─► Completing ─► Ready ─► Fetched
///    ▲            │                                   │
///    └────────────┴───────── (starvation / retry) ────┘
/// ```
///
/// `Launching` and `Completing` mean a callback is running on the consumer
/// thread; the task is in no queue meanwhile. A completion notification
/// for a `Launching` task moves it straight to `Completed`. `Failed` tasks
/// left a callback with an error and wait for cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLocation {
    Pending,
    Launching,
    Running,
    Completed,
    Completing,
    Ready,
    Fetched,
    Failed,
}

impl fmt::Display for TaskLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskLocation::Pending => "pending",
            TaskLocation::Launching => "launching",
            TaskLocation::Running => "running",
            TaskLocation::Completed => "completed",
            TaskLocation::Completing => "completing",
            TaskLocation::Ready => "ready",
            TaskLocation::Fetched => "fetched",
            TaskLocation::Failed => "failed",
        };
        f.write_str(name)
    }
}
