//! Pipeline performance counters

use std::time::Duration;

use serde::Serialize;

/// Counters accumulated by one task state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PerfStats {
    /// Units of input pulled from `next_chunk`
    pub tasks_created: usize,
    pub tasks_launched: usize,
    /// Launch callbacks that reported starvation
    pub launch_retries: usize,
    pub tasks_completed: usize,
    /// Completion callbacks that sent the task back to pending
    pub completion_retries: usize,
    pub tasks_released: usize,
    pub launch_time: Duration,
    pub complete_time: Duration,
    /// Time spent blocked on the latch
    pub sync_wait_time: Duration,
    pub short_waits: usize,
    pub long_waits: usize,
}

impl PerfStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log all counters at info level
    pub fn log(&self, label: &str) {
        tracing::info!(
            label,
            created = self.tasks_created,
            launched = self.tasks_launched,
            launch_retries = self.launch_retries,
            completed = self.tasks_completed,
            completion_retries = self.completion_retries,
            released = self.tasks_released,
            launch_ms = self.launch_time.as_secs_f64() * 1000.0,
            complete_ms = self.complete_time.as_secs_f64() * 1000.0,
            sync_wait_ms = self.sync_wait_time.as_secs_f64() * 1000.0,
            short_waits = self.short_waits,
            long_waits = self.long_waits,
            "GPU task pipeline statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_durations() {
        let stats = PerfStats {
            tasks_launched: 3,
            launch_time: Duration::from_millis(5),
            ..PerfStats::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["tasks_launched"], 3);
        assert_eq!(json["launch_time"]["nanos"], 5_000_000);
    }
}
