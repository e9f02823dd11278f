//! Pacing policy: delay admission in proportion to current usage.
//!
//! A client far below its ceiling goes straight through. As its count climbs
//! the gateway holds each request a little longer, and once the ceiling is
//! reached the request is parked until the window slides far enough for the
//! client to be back under it.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use super::controller::RateSnapshot;
use super::key::ClientKey;
use crate::error::{GatewayError, Result};

/// Pauses shorter than this are skipped.
pub const DEFAULT_MIN_PAUSE: Duration = Duration::from_millis(10);

/// Delay owed by a client that has `count` hits against `ceiling` per `period`.
///
/// Grows linearly with `count` and reaches one full period at the ceiling.
pub fn wait_duration(count: u64, ceiling: u64, period: Duration) -> Duration {
    if ceiling == 0 {
        return period;
    }
    let ratio = count as f64 / ceiling as f64;
    Duration::try_from_secs_f64(period.as_secs_f64() * ratio).unwrap_or(Duration::MAX)
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Count observed before the request was paced
    pub count: u64,
    /// Initial pacing delay applied
    pub paced: Duration,
    /// Times the request was parked because the ceiling was reached
    pub retries: u32,
}

/// How requests are delayed before admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    /// Pauses at or below this are skipped
    pub min_pause: Duration,
    /// Longest a request may stay parked over the ceiling; `None` waits forever
    pub max_stall: Option<Duration>,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            min_pause: DEFAULT_MIN_PAUSE,
            max_stall: None,
        }
    }
}

impl PacingPolicy {
    /// Pacing delay for `count` under the given snapshot.
    pub fn wait_for(&self, snapshot: &RateSnapshot, count: u64) -> Duration {
        wait_duration(count, snapshot.ceiling, snapshot.limiter.window().period())
    }

    /// Pace `key`, park it while it is over the ceiling, then record the hit.
    ///
    /// All waiting is done with tokio timers, so dropping the returned future
    /// (for instance when the client disconnects) abandons the request
    /// without recording it. With `max_stall` set, no pause is started that
    /// would carry the total stall past the bound.
    pub async fn admit(&self, snapshot: &RateSnapshot, key: &ClientKey) -> Result<Admission> {
        let limiter = &snapshot.limiter;
        let started = Instant::now();

        let count = limiter.count(key).await?;
        let wait = self.wait_for(snapshot, count);

        let mut paced = Duration::ZERO;
        if wait > self.min_pause {
            trace!(key = %key, count = count, wait = ?wait, "Pacing request");
            self.pause(key, started, wait).await?;
            paced = wait;
        }

        // A zero initial wait must not turn the retry loop into a spin.
        let retry_pause = wait.max(limiter.window().slice());
        let mut retries = 0u32;

        while limiter.exceeded(key).await? {
            retries += 1;
            debug!(key = %key, retries = retries, "Still exceeded");
            self.pause(key, started, retry_pause).await?;
        }

        limiter.inc(key).await?;

        Ok(Admission {
            count,
            paced,
            retries,
        })
    }

    /// Sleep for `duration`, or fail at once if that would overrun the stall bound.
    async fn pause(&self, key: &ClientKey, started: Instant, duration: Duration) -> Result<()> {
        if let Some(max_stall) = self.max_stall {
            let stalled = started.elapsed();
            if stalled + duration > max_stall {
                debug!(
                    key = %key,
                    stalled = ?stalled,
                    pause = ?duration,
                    "Giving up on request that would stall past the bound"
                );
                return Err(GatewayError::RateLimited {
                    stalled,
                    retry_after: duration,
                });
            }
        }
        sleep(duration).await;
        Ok(())
    }
}
