//! Production implementation of QuiesceContext using Tokio.

use crate::QuiesceContext;
use async_trait::async_trait;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

/// Production context backed by Tokio and the OS clock.
///
/// Spawning uses `tokio::task::spawn_local`, so the context must be used
/// from inside a `tokio::task::LocalSet`.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Rc-wrapped context for sharing across local tasks.
    pub fn shared() -> Rc<Self> {
        Rc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl QuiesceContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + 'static,
    {
        tokio::task::spawn_local(future);
    }

    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}
