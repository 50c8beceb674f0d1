//! Task tracker: the set of live tasks in a run and their states.

use crate::error::BlockedTask;
use quiesce_env::{BlockReason, TaskId, TaskState};
use std::collections::BTreeMap;

struct TaskRecord {
    name: String,
    state: TaskState,
    last_reason: Option<BlockReason>,
}

/// Tracks every non-Done task of one run.
///
/// The scheduler drives all transitions; the quiescence detector only reads.
pub struct TaskTracker {
    active: BTreeMap<TaskId, TaskRecord>,
    spawned: u64,
    completed: u64,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            active: BTreeMap::new(),
            spawned: 0,
            completed: 0,
        }
    }

    /// Adds a task in Runnable state.
    pub fn register(&mut self, id: TaskId, name: &str) {
        self.spawned += 1;
        self.active.insert(
            id,
            TaskRecord {
                name: name.to_string(),
                state: TaskState::Runnable,
                last_reason: None,
            },
        );
    }

    /// Marks a task blocked at a suspension point.
    pub fn mark_blocked(&mut self, id: TaskId, reason: BlockReason) {
        if let Some(record) = self.active.get_mut(&id) {
            record.state = TaskState::Blocked(reason);
            record.last_reason = Some(reason);
        }
    }

    /// Marks a blocked task runnable. Returns true if the task was blocked,
    /// false if it was already runnable or is gone.
    pub fn mark_runnable(&mut self, id: TaskId) -> bool {
        match self.active.get_mut(&id) {
            Some(record) if record.state.is_blocked() => {
                record.state = TaskState::Runnable;
                true
            }
            _ => false,
        }
    }

    /// Removes a finished task from the active set.
    pub fn mark_done(&mut self, id: TaskId) {
        if self.active.remove(&id).is_some() {
            self.completed += 1;
        }
    }

    /// State of a task; Done if it is not tracked.
    pub fn state(&self, id: TaskId) -> TaskState {
        self.active
            .get(&id)
            .map(|r| r.state)
            .unwrap_or(TaskState::Done)
    }

    /// True iff every live task other than `caller` is blocked.
    pub fn all_blocked_except(&self, caller: Option<TaskId>) -> bool {
        self.active
            .iter()
            .filter(|(id, _)| Some(**id) != caller)
            .all(|(_, r)| r.state.is_blocked())
    }

    /// Live (non-Done) task count.
    pub fn live(&self) -> usize {
        self.active.len()
    }

    /// Total tasks ever registered.
    pub fn spawned(&self) -> u64 {
        self.spawned
    }

    /// Total tasks that reached Done.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Snapshot of live tasks, optionally excluding one, for error reports.
    pub fn snapshot(&self, exclude: Option<TaskId>) -> Vec<BlockedTask> {
        self.active
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(id, r)| BlockedTask {
                task: *id,
                name: r.name.clone(),
                reason: r.last_reason,
            })
            .collect()
    }

    /// Forgets every task (run teardown).
    pub fn clear(&mut self) {
        self.active.clear();
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
