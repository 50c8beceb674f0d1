//! Harness handle implementing `QuiesceContext` for deterministic testing.

use crate::runtime::Sim;
use async_trait::async_trait;
use quiesce_env::QuiesceContext;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// Code written against [`QuiesceContext`] runs under the harness through
/// this impl:
/// - `now`/`system_time` read the run's virtual clock
/// - `sleep` registers a virtual timer, so the clock only moves at quiescence
/// - `spawn` registers the task with the run's tracker and scheduler
#[async_trait(?Send)]
impl QuiesceContext for Sim {
    fn now(&self) -> Duration {
        Sim::now(self)
    }

    fn system_time(&self) -> SystemTime {
        Sim::system_time(self)
    }

    async fn sleep(&self, duration: Duration) {
        Sim::sleep(self, duration).await
    }

    async fn yield_now(&self) {
        Sim::yield_now(self).await
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        // Detached: the run's leak check still requires it to finish.
        drop(self.spawn_named(name, future));
    }

    fn seed(&self) -> u64 {
        Sim::seed(self)
    }
}
