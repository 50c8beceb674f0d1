//! Failure taxonomy for harness runs.

use quiesce_env::{BlockReason, TaskId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// A task that was still alive when the run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub task: TaskId,
    pub name: String,
    /// Last known blocking reason (`None` if it never blocked).
    pub reason: Option<BlockReason>,
}

impl std::fmt::Display for BlockedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason {
            Some(reason) => write!(f, "{} ({}): {}", self.task, self.name, reason),
            None => write!(f, "{} ({}): runnable", self.task, self.name),
        }
    }
}

fn list(tasks: &[BlockedTask]) -> String {
    tasks.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Why a harness run failed.
///
/// Everything except [`HarnessError::TaskPanicked`] is a structural fault
/// detected by the harness; a panic is the test body's own assertion
/// failing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HarnessError {
    /// Tasks still alive after the root task finished
    #[error("task leak: {} task(s) outlived the root task: {}", leaked.len(), list(leaked))]
    Leak { leaked: Vec<BlockedTask> },

    /// Every task is blocked and nothing can wake them
    #[error("deadlock: all tasks are asleep: {}", list(blocked))]
    Deadlock { blocked: Vec<BlockedTask> },

    /// Attempted to move the virtual clock backward
    #[error("virtual clock regression from {now:?} to {target:?}")]
    BackwardTime { now: Duration, target: Duration },

    /// A task panicked (assertion failure in the body)
    #[error("{task} ({name}) panicked: {message}")]
    TaskPanicked {
        task: TaskId,
        name: String,
        message: String,
    },

    /// Scheduler step budget exhausted (livelock)
    #[error("step limit of {steps} exceeded")]
    StepLimitExceeded { steps: u64 },

    /// Real-time bound on the whole run exceeded
    #[error("run exceeded wall-clock timeout after {elapsed:?}")]
    WallClockTimeout { elapsed: Duration },
}

impl HarnessError {
    /// Returns true if the harness detected a structural problem, as opposed
    /// to the body failing one of its own assertions.
    pub fn is_harness_fault(&self) -> bool {
        !matches!(self, HarnessError::TaskPanicked { .. })
    }

    /// Short machine-friendly kind label for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            HarnessError::Leak { .. } => "leak",
            HarnessError::Deadlock { .. } => "deadlock",
            HarnessError::BackwardTime { .. } => "backward_time",
            HarnessError::TaskPanicked { .. } => "panic",
            HarnessError::StepLimitExceeded { .. } => "step_limit",
            HarnessError::WallClockTimeout { .. } => "wall_clock_timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leak_message_names_reason() {
        let err = HarnessError::Leak {
            leaked: vec![BlockedTask {
                task: TaskId(3),
                name: "worker".into(),
                reason: Some(BlockReason::ChannelRecv),
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("task#3"));
        assert!(msg.contains("waiting on channel receive"));
        assert!(err.is_harness_fault());
    }

    #[test]
    fn test_panic_is_not_harness_fault() {
        let err = HarnessError::TaskPanicked {
            task: TaskId::ROOT,
            name: "root".into(),
            message: "expected 1, got 3".into(),
        };
        assert!(!err.is_harness_fault());
        assert_eq!(err.kind(), "panic");
    }
}
