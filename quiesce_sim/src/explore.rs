//! Schedule exploration: run a body under every interleaving up to a bound.
//!
//! Exploration is a depth-first walk of the decision tree. Each run replays
//! a prefix of choices and then takes index 0 at every later choice point.
//! After a passing run, the deepest decision (within `max_depth`) that still
//! has an untried alternative is bumped by one and everything below it is
//! discarded; that becomes the next prefix. The walk ends when no decision
//! has alternatives left (exhausted), when `max_schedules` runs have been
//! made, or at the first failing run.

use crate::error::HarnessError;
use crate::harness::{Harness, HarnessConfig};
use crate::runtime::Sim;
use crate::scheduler::{Decision, Schedule, SchedulePolicy};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Bounds for an exploration.
#[derive(Debug, Clone)]
pub struct ExploreConfig {
    /// Maximum number of distinct schedules to run
    pub max_schedules: usize,

    /// Choice points beyond this depth always take index 0
    pub max_depth: usize,

    /// Configuration applied to every individual run (policy is overridden)
    pub harness: HarnessConfig,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            max_schedules: 1000,
            max_depth: 64,
            harness: HarnessConfig::default(),
        }
    }
}

impl ExploreConfig {
    pub fn with_max_schedules(mut self, max_schedules: usize) -> Self {
        self.max_schedules = max_schedules;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_harness(mut self, harness: HarnessConfig) -> Self {
        self.harness = harness;
        self
    }
}

/// Outcome of an exploration.
#[derive(Debug, Clone)]
pub enum ExplorationResult {
    /// No explored schedule failed.
    AllPassed {
        schedules: usize,
        /// True if every interleaving within `max_depth` was covered
        exhausted: bool,
    },

    /// A schedule failed; replaying `schedule` reproduces `error`.
    Failed {
        schedule: Schedule,
        error: HarnessError,
        schedules: usize,
    },
}

impl ExplorationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExplorationResult::AllPassed { .. })
    }

    /// Number of schedules that were run.
    pub fn schedules(&self) -> usize {
        match self {
            ExplorationResult::AllPassed { schedules, .. } => *schedules,
            ExplorationResult::Failed { schedules, .. } => *schedules,
        }
    }

    /// Serializable view for reports.
    pub fn summary(&self) -> ExplorationSummary {
        match self {
            ExplorationResult::AllPassed {
                schedules,
                exhausted,
            } => ExplorationSummary {
                passed: true,
                schedules: *schedules,
                exhausted: *exhausted,
                schedule: None,
                failure_kind: None,
                failure: None,
            },
            ExplorationResult::Failed {
                schedule,
                error,
                schedules,
            } => ExplorationSummary {
                passed: false,
                schedules: *schedules,
                exhausted: false,
                schedule: Some(schedule.clone()),
                failure_kind: Some(error.kind().to_string()),
                failure: Some(error.to_string()),
            },
        }
    }
}

/// Flat, serializable form of an [`ExplorationResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorationSummary {
    pub passed: bool,
    pub schedules: usize,
    pub exhausted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Computes the prefix of the next schedule to try, or `None` when the
/// tree is exhausted.
fn next_prefix(decisions: &[Decision], max_depth: usize) -> Option<Schedule> {
    let mut trace: Vec<Decision> = decisions.iter().take(max_depth).copied().collect();
    while let Some(last) = trace.last() {
        if last.chosen + 1 < last.of {
            break;
        }
        trace.pop();
    }
    let last = trace.last_mut()?;
    last.chosen += 1;
    Some(Schedule::from_decisions(&trace))
}

/// Runs a body repeatedly under distinct schedules.
pub struct Explorer {
    config: ExploreConfig,
}

impl Explorer {
    pub fn new(config: ExploreConfig) -> Self {
        Self { config }
    }

    /// Explores `body` until a failure, exhaustion or the schedule bound.
    pub fn explore<F, Fut>(&self, body: F) -> ExplorationResult
    where
        F: Fn(Sim) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let harness = Harness::new(self.config.harness.clone());
        let body = Rc::new(body);
        let mut prefix = Schedule::default();

        for run in 1..=self.config.max_schedules {
            let policy = SchedulePolicy::Replay {
                prefix: prefix.clone(),
            };
            let b = Rc::clone(&body);
            let (result, decisions) = harness.run_recorded(&policy, move |sim| b(sim));
            let schedule = Schedule::from_decisions(&decisions);

            if let Err(error) = result {
                warn!(schedules = run, %schedule, %error, "exploration found a failing schedule");
                return ExplorationResult::Failed {
                    schedule,
                    error,
                    schedules: run,
                };
            }
            debug!(run, %schedule, "schedule passed");

            match next_prefix(&decisions, self.config.max_depth) {
                Some(next) => prefix = next,
                None => {
                    info!(schedules = run, "exploration exhausted all interleavings");
                    return ExplorationResult::AllPassed {
                        schedules: run,
                        exhausted: true,
                    };
                }
            }
        }

        info!(
            schedules = self.config.max_schedules,
            "exploration reached its schedule bound"
        );
        ExplorationResult::AllPassed {
            schedules: self.config.max_schedules,
            exhausted: false,
        }
    }
}

/// Explores `body` with the given bounds.
pub fn explore<F, Fut>(body: F, config: ExploreConfig) -> ExplorationResult
where
    F: Fn(Sim) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    Explorer::new(config).explore(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn d(chosen: usize, of: usize) -> Decision {
        Decision { chosen, of }
    }

    #[test]
    fn test_next_prefix_bumps_deepest_open_choice() {
        let next = next_prefix(&[d(0, 2), d(0, 3), d(2, 3)], 64).unwrap();
        assert_eq!(next, Schedule(vec![0, 1]));
    }

    #[test]
    fn test_next_prefix_exhausted() {
        assert_eq!(next_prefix(&[d(1, 2), d(2, 3)], 64), None);
        assert_eq!(next_prefix(&[], 64), None);
    }

    #[test]
    fn test_next_prefix_ignores_choices_past_depth() {
        assert_eq!(next_prefix(&[d(1, 2), d(0, 3)], 1), None);
    }

    #[test]
    fn test_explore_covers_both_orders_of_two_tasks() {
        thread_local! {
            static ORDERS: Cell<(u32, u32)> = Cell::new((0, 0));
        }
        let result = explore(
            |sim| async move {
                let first = Rc::new(Cell::new(0u8));
                for i in 1..=2u8 {
                    let first = first.clone();
                    sim.spawn(async move {
                        if first.get() == 0 {
                            first.set(i);
                        }
                    });
                }
                sim.wait().await;
                ORDERS.with(|o| {
                    let (a, b) = o.get();
                    o.set(if first.get() == 1 { (a + 1, b) } else { (a, b + 1) });
                });
            },
            ExploreConfig::default(),
        );

        assert!(result.is_success());
        let (a, b) = ORDERS.with(Cell::get);
        assert!(a >= 1 && b >= 1, "both orders explored: {a} / {b}");
        assert!(matches!(result, ExplorationResult::AllPassed { exhausted: true, .. }));
    }

    #[test]
    fn test_explore_stops_at_schedule_bound() {
        let result = explore(
            |sim| async move {
                for _ in 0..4 {
                    let s = sim.clone();
                    sim.spawn(async move { s.yield_now().await });
                }
                sim.wait().await;
            },
            ExploreConfig::default().with_max_schedules(5),
        );
        assert!(matches!(
            result,
            ExplorationResult::AllPassed {
                schedules: 5,
                exhausted: false
            }
        ));
    }
}
