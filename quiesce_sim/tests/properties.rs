//! Property tests: results that must hold for every seed and schedule.

use proptest::prelude::*;
use quiesce_sim::sync::WaitGroup;
use quiesce_sim::{Harness, HarnessConfig, Schedule, SchedulePolicy};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

fn random_harness(seed: u64) -> Harness {
    Harness::new(
        HarnessConfig::default()
            .with_seed(seed)
            .with_policy(SchedulePolicy::Random { seed }),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Increments between await points are never lost, whatever the order.
    #[test]
    fn prop_counter_equals_task_count(seed in any::<u64>(), tasks in 1usize..8, yields in 0usize..4) {
        let counter = Rc::new(Cell::new(0usize));
        let observed = counter.clone();
        let report = random_harness(seed).run(move |sim| async move {
            let wg = WaitGroup::new(&sim);
            for _ in 0..tasks {
                wg.add(1);
                let (wg, counter, s) = (wg.clone(), counter.clone(), sim.clone());
                sim.spawn(async move {
                    for _ in 0..yields {
                        s.yield_now().await;
                    }
                    counter.set(counter.get() + 1);
                    wg.done();
                });
            }
            sim.wait().await;
            wg.wait().await;
        });

        prop_assert!(report.is_ok(), "{:?}", report);
        prop_assert_eq!(observed.get(), tasks);
    }

    /// Every sleeper wakes exactly at its deadline, in deadline order.
    #[test]
    fn prop_timers_fire_in_deadline_order(
        seed in any::<u64>(),
        deadlines in prop::collection::vec(0u64..10_000, 1..16),
    ) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let observed = log.clone();
        let expected_end = deadlines.iter().copied().max().unwrap_or(0);
        let sleepers = deadlines.len();
        let report = random_harness(seed).run(move |sim| async move {
            for ms in deadlines {
                let (s, log) = (sim.clone(), log.clone());
                sim.spawn(async move {
                    s.sleep(Duration::from_millis(ms)).await;
                    log.borrow_mut().push((ms, s.now()));
                });
            }
            sim.sleep_until(Duration::from_millis(expected_end)).await;
            sim.wait().await;
        });

        let report = report.map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(report.final_time, Duration::from_millis(expected_end));

        let log = observed.borrow();
        prop_assert_eq!(log.len(), sleepers);
        for (ms, woke_at) in log.iter() {
            prop_assert_eq!(*woke_at, Duration::from_millis(*ms));
        }
        for pair in log.windows(2) {
            prop_assert!(pair[0].0 <= pair[1].0, "fired out of order: {:?}", *log);
        }
    }

    /// Same seed, same policy: identical schedule.
    #[test]
    fn prop_random_policy_is_reproducible(seed in any::<u64>()) {
        let body = |sim: quiesce_sim::Sim| async move {
            for _ in 0..3 {
                let s = sim.clone();
                sim.spawn(async move {
                    s.yield_now().await;
                    s.yield_now().await;
                });
            }
            sim.wait().await;
        };
        let a = random_harness(seed).run(body).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let b = random_harness(seed).run(body).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(a.schedule, b.schedule);
        prop_assert_eq!(a.steps, b.steps);
    }

    #[test]
    fn prop_schedule_string_round_trip(choices in prop::collection::vec(0usize..16, 0..32)) {
        let schedule = Schedule(choices);
        let parsed: Schedule = schedule.to_string().parse().map_err(TestCaseError::fail)?;
        prop_assert_eq!(parsed, schedule);
    }
}
