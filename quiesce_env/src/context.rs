//! Core environment context trait for code under test.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for environment interaction.
///
/// This trait abstracts time and task spawning so that the same concurrent
/// code can run in production (tokio) and under the deterministic harness.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, `spawn_local`
/// - **Simulation**: `quiesce_sim::Sim` - virtual clock, cooperative scheduler
///
/// # Determinism
///
/// Under the harness, every method that would normally introduce
/// non-determinism (time, scheduling order) is controlled by the run.
/// Futures are not required to be `Send`: a harness run is single-threaded.
#[async_trait(?Send)]
pub trait QuiesceContext: 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// In simulation, this is derived from virtual clock + a fixed epoch.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: registers a timer against the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Gives other runnable tasks a chance to run.
    async fn yield_now(&self);

    /// Spawns a background task.
    ///
    /// In production: `tokio::task::spawn_local` (requires a `LocalSet`)
    /// In simulation: registers the task with the harness tracker
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + 'static;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
