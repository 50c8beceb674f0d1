//! Error types for the quiesce environment abstraction.

use thiserror::Error;

/// Errors surfaced to task code by environment primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// The other side of a channel is gone
    #[error("Channel closed")]
    ChannelClosed,

    /// The governing context was cancelled
    #[error("context canceled")]
    Canceled,

    /// The governing context's deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a timeout error from a duration.
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout(after.as_millis() as u64)
    }
}
