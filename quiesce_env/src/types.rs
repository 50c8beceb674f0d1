//! Common types for the quiesce environment abstraction.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Identifier of a task inside one harness run.
///
/// Ids are handed out in spawn order starting at 0 (the root task), so they
/// double as the stable tie-break key for deterministic scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    /// The root task of every run.
    pub const ROOT: TaskId = TaskId(0);
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Lifecycle state of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Queued to be polled.
    Runnable,

    /// Suspended at a harness-visible suspension point.
    Blocked(BlockReason),

    /// Finished (returned or was torn down).
    Done,
}

impl TaskState {
    /// Returns true if the task is blocked.
    pub fn is_blocked(&self) -> bool {
        matches!(self, TaskState::Blocked(_))
    }
}

/// Why a task is suspended.
///
/// Every harness primitive records one of these before returning
/// `Poll::Pending`, which is what makes a block "durable" from the
/// scheduler's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockReason {
    /// Sending into a full channel.
    ChannelSend,

    /// Receiving from an empty channel.
    ChannelRecv,

    /// Acquiring a held mutex.
    Lock,

    /// Sleeping until a virtual deadline.
    Sleep {
        /// Deadline as virtual time since run start.
        deadline: Duration,
    },

    /// Inside `wait()`.
    Wait,

    /// Waiting for a wait group counter to drop to zero.
    WaitGroup,

    /// Awaiting another task's completion.
    Join,

    /// Waiting for a context to be cancelled.
    Cancellation,

    /// Pending on a future the harness does not know about.
    Unknown,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::ChannelSend => write!(f, "waiting on channel send"),
            BlockReason::ChannelRecv => write!(f, "waiting on channel receive"),
            BlockReason::Lock => write!(f, "waiting on lock"),
            BlockReason::Sleep { deadline } => write!(f, "waiting on timer (deadline {:?})", deadline),
            BlockReason::Wait => write!(f, "waiting for quiescence"),
            BlockReason::WaitGroup => write!(f, "waiting on wait group"),
            BlockReason::Join => write!(f, "waiting on task join"),
            BlockReason::Cancellation => write!(f, "waiting on cancellation"),
            BlockReason::Unknown => write!(f, "pending on external future"),
        }
    }
}

/// Identifier of a single harness run, used to correlate logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Creates a new random RunId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic RunId from a seed and a run ordinal.
    pub fn from_seed(seed: u64, ordinal: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&ordinal.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_from_seed_is_stable() {
        assert_eq!(RunId::from_seed(42, 3), RunId::from_seed(42, 3));
        assert_ne!(RunId::from_seed(42, 3), RunId::from_seed(42, 4));
        assert_eq!(RunId::from_seed(7, 0).to_string().len(), 8);
    }

    #[test]
    fn test_block_reason_display() {
        assert_eq!(BlockReason::Lock.to_string(), "waiting on lock");
        assert_eq!(
            BlockReason::Sleep { deadline: Duration::from_secs(1) }.to_string(),
            "waiting on timer (deadline 1s)"
        );
    }

    #[test]
    fn test_task_id_root() {
        assert_eq!(TaskId::ROOT, TaskId(0));
        assert_eq!(TaskId(5).to_string(), "task#5");
    }
}
