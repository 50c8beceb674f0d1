//! Scenario runner - executes built-in scenarios and checks their outcome.

use crate::error::HarnessError;
use crate::explore::{ExplorationResult, ExploreConfig, Explorer};
use crate::harness::{Harness, HarnessConfig, RunReport};
use crate::runtime::{RunEvent, Sim};
use crate::scenarios::{self, Expectation, ScenarioId};
use crate::scheduler::{Schedule, SchedulePolicy};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{info, warn};

/// How a scenario was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// One run under the configured policy
    Standard,

    /// One run following a recorded schedule
    Replay,

    /// Schedule exploration
    Explore,
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    pub mode: RunMode,

    /// Whether the outcome matched the scenario's expectation
    pub passed: bool,

    /// Runs executed (1 outside exploration)
    pub schedules_run: usize,

    /// Final virtual time in seconds (0 if the run failed)
    pub final_time_secs: f64,

    /// Tasks spawned, including the root (0 if the run failed)
    pub tasks_spawned: u64,

    /// Error kind of the failing run, expected or not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<String>,

    /// Why `passed` is false, or the failure that was expected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Schedule of the reported run (failing schedule under exploration)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,

    /// True if exploration covered every interleaving within its depth
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub exhausted: bool,

    /// Harness transitions of a passing standard or replay run
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<RunEvent>,
}

impl ScenarioResult {
    fn new(scenario: ScenarioId, seed: u64, mode: RunMode) -> Self {
        Self {
            scenario,
            seed,
            mode,
            passed: false,
            schedules_run: 1,
            final_time_secs: 0.0,
            tasks_spawned: 0,
            failure_kind: None,
            failure_reason: None,
            schedule: None,
            exhausted: false,
            events: Vec::new(),
        }
    }
}

/// Runs built-in scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Tie-break policy for standard runs
    policy: SchedulePolicy,

    /// Per-run step budget
    max_steps: u64,

    /// Explore instead of running once
    explore: Option<ExploreConfig>,

    /// Replay this schedule instead of running under `policy`
    replay: Option<Schedule>,

    /// Record the event log of standard and replay runs
    record_events: bool,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            policy: SchedulePolicy::Fifo,
            max_steps: HarnessConfig::default().max_steps,
            explore: None,
            replay: None,
            record_events: false,
        }
    }

    /// Sets the scheduling policy for standard runs.
    pub fn with_policy(mut self, policy: SchedulePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the per-run step budget.
    pub fn with_max_steps(mut self, steps: u64) -> Self {
        self.max_steps = steps;
        self
    }

    /// Explores schedules instead of running once.
    pub fn with_explore(mut self, config: ExploreConfig) -> Self {
        self.explore = Some(config);
        self
    }

    /// Replays a recorded schedule instead of running under the policy.
    pub fn with_replay(mut self, schedule: Schedule) -> Self {
        self.replay = Some(schedule);
        self
    }

    /// Records the harness event log into the result.
    pub fn with_event_log(mut self, enabled: bool) -> Self {
        self.record_events = enabled;
        self
    }

    fn harness_config(&self) -> HarnessConfig {
        HarnessConfig::default()
            .with_seed(self.seed)
            .with_policy(self.policy.clone())
            .with_max_steps(self.max_steps)
            .with_event_log(self.record_events)
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        match scenario {
            ScenarioId::AfterFunc => self.execute(scenario, scenarios::after_func),
            ScenarioId::WithTimeout => self.execute(scenario, scenarios::with_timeout),
            ScenarioId::ExpectContinue => self.execute(scenario, scenarios::expect_continue),
            ScenarioId::OnceDo => self.execute(scenario, scenarios::once_do),
            ScenarioId::MutexLockUnlock => self.execute(scenario, scenarios::mutex_lock_unlock),
            ScenarioId::WaitGroup => self.execute(scenario, scenarios::wait_group),
            ScenarioId::ChannelBuffer => self.execute(scenario, scenarios::channel_buffer),
            ScenarioId::TimerOrder => self.execute(scenario, scenarios::timer_order),
            ScenarioId::RacyCounter => self.execute(scenario, scenarios::racy_counter),
            ScenarioId::LockedCounter => self.execute(scenario, scenarios::locked_counter),
            ScenarioId::Leak => self.execute(scenario, scenarios::leak),
            ScenarioId::Deadlock => self.execute(scenario, scenarios::deadlock),
        }
    }

    fn execute<F, Fut>(&self, scenario: ScenarioId, body: F) -> ScenarioResult
    where
        F: Fn(Sim) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let expectation = scenario.expectation();
        let result = if let Some(config) = &self.explore {
            let harness = self.harness_config().with_event_log(false);
            let config = config.clone().with_harness(harness);
            let exploration = Explorer::new(config).explore(body);
            self.judge_exploration(scenario, expectation, exploration)
        } else {
            let harness = Harness::new(self.harness_config());
            match &self.replay {
                Some(schedule) => {
                    let outcome = harness.replay(schedule, body);
                    self.judge_run(scenario, RunMode::Replay, expectation, outcome)
                }
                None => {
                    let outcome = harness.run(body);
                    self.judge_run(scenario, RunMode::Standard, expectation, outcome)
                }
            }
        };

        if result.passed {
            info!("✓ {} passed ({:?}, {} schedule(s))", scenario, result.mode, result.schedules_run);
        } else {
            warn!(
                "✗ {} failed: {}",
                scenario,
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
        result
    }

    fn judge_run(
        &self,
        scenario: ScenarioId,
        mode: RunMode,
        expectation: Expectation,
        outcome: Result<RunReport, HarnessError>,
    ) -> ScenarioResult {
        let mut result = ScenarioResult::new(scenario, self.seed, mode);
        match outcome {
            Ok(report) => {
                result.final_time_secs = report.final_time.as_secs_f64();
                result.tasks_spawned = report.tasks_spawned;
                result.schedule = Some(report.schedule);
                result.events = report.events;
                result.passed = match expectation {
                    Expectation::Pass | Expectation::RaceDetected => true,
                    Expectation::HarnessFault(kind) => {
                        result.failure_reason = Some(format!("expected a {kind} fault, run passed"));
                        false
                    }
                };
            }
            Err(error) => {
                result.failure_kind = Some(error.kind().to_string());
                result.passed = match expectation {
                    Expectation::Pass => false,
                    // A random policy may expose the race on a single run.
                    Expectation::RaceDetected => !error.is_harness_fault(),
                    Expectation::HarnessFault(kind) => error.kind() == kind,
                };
                result.failure_reason = Some(error.to_string());
            }
        }
        result
    }

    fn judge_exploration(
        &self,
        scenario: ScenarioId,
        expectation: Expectation,
        exploration: ExplorationResult,
    ) -> ScenarioResult {
        let mut result = ScenarioResult::new(scenario, self.seed, RunMode::Explore);
        result.schedules_run = exploration.schedules();
        match exploration {
            ExplorationResult::AllPassed { exhausted, .. } => {
                result.exhausted = exhausted;
                result.passed = match expectation {
                    Expectation::Pass => true,
                    Expectation::RaceDetected => {
                        result.failure_reason =
                            Some("exploration did not expose the race".to_string());
                        false
                    }
                    Expectation::HarnessFault(kind) => {
                        result.failure_reason =
                            Some(format!("expected a {kind} fault, every schedule passed"));
                        false
                    }
                };
            }
            ExplorationResult::Failed {
                schedule, error, ..
            } => {
                result.failure_kind = Some(error.kind().to_string());
                result.passed = match expectation {
                    Expectation::Pass => false,
                    Expectation::RaceDetected => !error.is_harness_fault(),
                    Expectation::HarnessFault(kind) => error.kind() == kind,
                };
                result.failure_reason = Some(format!("schedule {}: {}", schedule, error));
                result.schedule = Some(schedule);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_scenario_meets_expectation() {
        let runner = ScenarioRunner::new(42);
        for scenario in ScenarioId::all() {
            let result = runner.run(scenario);
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
        }
    }

    #[test]
    fn test_every_scenario_meets_expectation_under_exploration() {
        let runner = ScenarioRunner::new(42).with_explore(ExploreConfig::default().with_max_schedules(200));
        for scenario in ScenarioId::all() {
            let result = runner.run(scenario);
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
        }
    }

    #[test]
    fn test_racy_counter_passes_fifo_but_fails_exploration() {
        let standard = ScenarioRunner::new(7).run(ScenarioId::RacyCounter);
        assert!(standard.passed);
        assert_eq!(standard.failure_kind, None);

        let explored = ScenarioRunner::new(7)
            .with_explore(ExploreConfig::default())
            .run(ScenarioId::RacyCounter);
        assert!(explored.passed);
        assert_eq!(explored.failure_kind.as_deref(), Some("panic"));
        assert!(explored
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("expected 2, got 1")));

        // The reported schedule reproduces the lost update.
        let schedule = explored.schedule.unwrap();
        let replayed = ScenarioRunner::new(7)
            .with_replay(schedule)
            .run(ScenarioId::RacyCounter);
        assert_eq!(replayed.mode, RunMode::Replay);
        assert_eq!(replayed.failure_kind.as_deref(), Some("panic"));
    }

    #[test]
    fn test_locked_counter_exhausts_all_schedules() {
        let result = ScenarioRunner::new(1)
            .with_explore(ExploreConfig::default())
            .run(ScenarioId::LockedCounter);
        assert!(result.passed);
        assert!(result.exhausted);
        assert!(result.schedules_run > 1);
    }

    #[test]
    fn test_random_policy_runs_are_seed_deterministic() {
        let run = |seed| {
            ScenarioRunner::new(seed)
                .with_policy(SchedulePolicy::Random { seed })
                .run(ScenarioId::OnceDo)
                .schedule
        };
        assert_eq!(run(99), run(99));
    }

    #[test]
    fn test_event_log_is_attached_on_request() {
        let quiet = ScenarioRunner::new(5).run(ScenarioId::AfterFunc);
        assert!(quiet.events.is_empty());

        let logged = ScenarioRunner::new(5)
            .with_event_log(true)
            .run(ScenarioId::AfterFunc);
        assert!(logged
            .events
            .iter()
            .any(|e| matches!(e, RunEvent::Spawned { name, .. } if name == "after_func")));
    }

    #[test]
    fn test_fault_scenarios_report_kind() {
        let runner = ScenarioRunner::new(42);
        assert_eq!(runner.run(ScenarioId::Leak).failure_kind.as_deref(), Some("leak"));
        assert_eq!(
            runner.run(ScenarioId::Deadlock).failure_kind.as_deref(),
            Some("deadlock")
        );
    }
}
