//! Deterministic scheduler: run queue, tie-break policies and the decision log.
//!
//! Tasks enter the run queue in wake order (new tasks in spawn order). Each
//! time more than one task is runnable the policy picks an index into the
//! queue; that pick is a *choice point* and is recorded as a [`Decision`].
//! The sequence of picks is a [`Schedule`], which is enough to replay the
//! run exactly.

use quiesce_env::TaskId;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{trace, warn};

/// How the scheduler breaks ties among runnable tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulePolicy {
    /// Always run the task that became runnable first.
    #[default]
    Fifo,

    /// Pick uniformly at random from a ChaCha8 stream seeded with `seed`.
    Random { seed: u64 },

    /// Follow `prefix` at the first choice points, then behave like `Fifo`.
    Replay { prefix: Schedule },
}

/// One choice point: `chosen` out of `of` runnable tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub chosen: usize,
    pub of: usize,
}

/// Replay key: the index picked at every choice point, in order.
///
/// Rendered as dot-separated indices (`"0.1.0"`); the empty schedule is `"-"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Schedule(pub Vec<usize>);

impl Schedule {
    pub fn from_decisions(decisions: &[Decision]) -> Self {
        Self(decisions.iter().map(|d| d.chosen).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "-");
        }
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl std::str::FromStr for Schedule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "-" {
            return Ok(Schedule::default());
        }
        s.split('.')
            .map(|part| {
                part.parse::<usize>()
                    .map_err(|_| format!("Invalid schedule component: {:?}", part))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Schedule)
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> Self {
        schedule.to_string()
    }
}

impl TryFrom<String> for Schedule {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

enum Chooser {
    Fifo,
    Random(ChaCha8Rng),
    Replay { prefix: Vec<usize> },
}

/// Run queue plus tie-break policy for one run.
pub struct Scheduler {
    run_queue: VecDeque<TaskId>,
    chooser: Chooser,
    decisions: Vec<Decision>,
}

impl Scheduler {
    pub fn new(policy: &SchedulePolicy) -> Self {
        let chooser = match policy {
            SchedulePolicy::Fifo => Chooser::Fifo,
            SchedulePolicy::Random { seed } => Chooser::Random(ChaCha8Rng::seed_from_u64(*seed)),
            SchedulePolicy::Replay { prefix } => Chooser::Replay {
                prefix: prefix.0.clone(),
            },
        };
        Self {
            run_queue: VecDeque::new(),
            chooser,
            decisions: Vec::new(),
        }
    }

    /// Appends a task to the run queue.
    pub fn enqueue(&mut self, id: TaskId) {
        self.run_queue.push_back(id);
    }

    /// Removes and returns the next task to poll, recording a decision when
    /// more than one task was runnable.
    pub fn next(&mut self) -> Option<TaskId> {
        let of = self.run_queue.len();
        if of <= 1 {
            return self.run_queue.pop_front();
        }

        let depth = self.decisions.len();
        let chosen = match &mut self.chooser {
            Chooser::Fifo => 0,
            Chooser::Random(rng) => rng.gen_range(0..of),
            Chooser::Replay { prefix } => match prefix.get(depth) {
                Some(&index) if index < of => index,
                Some(&index) => {
                    warn!(depth, index, of, "replayed choice out of range, body is not deterministic");
                    of - 1
                }
                None => 0,
            },
        };

        self.decisions.push(Decision { chosen, of });
        trace!(depth, chosen, of, "choice point");
        self.run_queue.remove(chosen)
    }

    /// True if nothing is runnable.
    pub fn is_idle(&self) -> bool {
        self.run_queue.is_empty()
    }

    /// Choice points taken so far.
    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    /// Drops queued tasks (run teardown).
    pub fn clear(&mut self) {
        self.run_queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(scheduler: &mut Scheduler, n: u64) {
        for i in 0..n {
            scheduler.enqueue(TaskId(i));
        }
    }

    #[test]
    fn test_fifo_runs_in_queue_order() {
        let mut scheduler = Scheduler::new(&SchedulePolicy::Fifo);
        fill(&mut scheduler, 3);

        assert_eq!(scheduler.next(), Some(TaskId(0)));
        assert_eq!(scheduler.next(), Some(TaskId(1)));
        assert_eq!(scheduler.next(), Some(TaskId(2)));
        assert_eq!(scheduler.next(), None);

        // Only the first two picks had an alternative
        assert_eq!(
            scheduler.decisions(),
            &[Decision { chosen: 0, of: 3 }, Decision { chosen: 0, of: 2 }]
        );
    }

    #[test]
    fn test_replay_follows_prefix_then_fifo() {
        let prefix: Schedule = "2.0".parse().unwrap();
        let mut scheduler = Scheduler::new(&SchedulePolicy::Replay { prefix });
        fill(&mut scheduler, 4);

        assert_eq!(scheduler.next(), Some(TaskId(2)));
        assert_eq!(scheduler.next(), Some(TaskId(0)));
        assert_eq!(scheduler.next(), Some(TaskId(1)));
        assert_eq!(scheduler.next(), Some(TaskId(3)));
        assert_eq!(Schedule::from_decisions(scheduler.decisions()).to_string(), "2.0.0");
    }

    #[test]
    fn test_random_is_seed_deterministic() {
        let picks = |seed| {
            let mut scheduler = Scheduler::new(&SchedulePolicy::Random { seed });
            fill(&mut scheduler, 8);
            (0..8).filter_map(|_| scheduler.next()).collect::<Vec<_>>()
        };
        assert_eq!(picks(7), picks(7));
        assert_eq!(picks(7).len(), 8);
    }

    #[test]
    fn test_schedule_parse_and_display() {
        let schedule: Schedule = "0.3.1".parse().unwrap();
        assert_eq!(schedule, Schedule(vec![0, 3, 1]));
        assert_eq!(schedule.to_string(), "0.3.1");

        assert!("".parse::<Schedule>().unwrap().is_empty());
        assert_eq!(Schedule::default().to_string(), "-");
        assert!("0.x".parse::<Schedule>().is_err());
    }
}
