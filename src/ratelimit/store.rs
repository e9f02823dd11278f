//! Shared counter store abstraction.
//!
//! The gateway never owns rate accounting itself. Counts live in a store that
//! every gateway instance can reach, and this trait is the whole contract the
//! limiter relies on.

use async_trait::async_trait;
use thiserror::Error;

use super::window::SlidingWindow;

/// Errors raised by a counter store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached at all.
    #[error("store unreachable: {0}")]
    Unavailable(String),
    /// The store answered with an error.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Trait for counter store implementations.
///
/// Implementations must make `increment` atomic per key: concurrent callers
/// on different gateway instances each observe a distinct new count.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record one hit for `key` in the current slice and return the window total.
    async fn increment(&self, key: &str, window: &SlidingWindow) -> StoreResult<u64>;

    /// Current window total for `key`, zero if nothing was recorded.
    async fn count(&self, key: &str, window: &SlidingWindow) -> StoreResult<u64>;

    /// Hits left before `ceiling` is reached. May be negative.
    async fn remaining(&self, key: &str, window: &SlidingWindow, ceiling: u64) -> StoreResult<i64> {
        let count = self.count(key, window).await?;
        let remaining = i128::from(ceiling) - i128::from(count);
        Ok(remaining.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64)
    }

    /// Short backend name for logging.
    fn name(&self) -> &'static str;
}
