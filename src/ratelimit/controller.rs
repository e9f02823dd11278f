//! Runtime-adjustable rate ceiling.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use super::limiter::RateLimiter;
use crate::error::{GatewayError, Result};

/// The ceiling and the limiter bound to it, published together.
#[derive(Debug)]
pub struct RateSnapshot {
    /// Hits allowed per window
    pub ceiling: u64,
    /// Limiter bound to `ceiling`
    pub limiter: RateLimiter,
    /// Bumped on every successful update
    pub version: u64,
}

/// Holds the active rate ceiling and swaps it on reconfiguration.
///
/// Readers take an `Arc` snapshot and keep using it for the whole request,
/// so a concurrent update never hands them a ceiling from one generation and
/// a limiter from another. In-flight requests finish against the snapshot
/// they started with.
pub struct RateController {
    current: RwLock<Arc<RateSnapshot>>,
}

impl RateController {
    /// Create a controller publishing `limiter` at its own ceiling.
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            current: RwLock::new(Arc::new(RateSnapshot {
                ceiling: limiter.ceiling(),
                limiter,
                version: 0,
            })),
        }
    }

    /// The active snapshot.
    pub fn snapshot(&self) -> Arc<RateSnapshot> {
        self.current.read().clone()
    }

    /// The active ceiling.
    pub fn current_ceiling(&self) -> u64 {
        self.current.read().ceiling
    }

    /// Replace the ceiling, building a new limiter for it.
    ///
    /// Fails with `InvalidArgument` for zero or negative values, leaving the
    /// active snapshot untouched.
    pub fn set_ceiling(&self, ceiling: i64) -> Result<Arc<RateSnapshot>> {
        if ceiling <= 0 {
            warn!(requested = ceiling, "Rejected non-positive rate ceiling");
            return Err(GatewayError::InvalidArgument(format!(
                "new rate must be greater than 0, got {}",
                ceiling
            )));
        }
        let ceiling = ceiling as u64;

        let mut current = self.current.write();
        let next = Arc::new(RateSnapshot {
            ceiling,
            limiter: current.limiter.with_ceiling(ceiling),
            version: current.version + 1,
        });

        info!(
            old_ceiling = current.ceiling,
            new_ceiling = ceiling,
            version = next.version,
            "New rate set"
        );

        *current = next.clone();
        Ok(next)
    }

    /// Parse a decimal ceiling and apply it.
    pub fn set_ceiling_str(&self, raw: &str) -> Result<Arc<RateSnapshot>> {
        let ceiling: i64 = raw.trim().parse().map_err(|e| {
            warn!(input = %raw, error = %e, "Could not parse rate ceiling");
            GatewayError::InvalidArgument(format!("could not parse integer {:?}: {}", raw, e))
        })?;
        self.set_ceiling(ceiling)
    }
}

impl std::fmt::Debug for RateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateController")
            .field("current", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{MemoryStore, SlidingWindow, DEFAULT_NAMESPACE};

    fn create_test_controller(ceiling: u64) -> RateController {
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            DEFAULT_NAMESPACE,
            SlidingWindow::default(),
            ceiling,
        );
        RateController::new(limiter)
    }

    #[test]
    fn test_initial_snapshot() {
        let controller = create_test_controller(500);
        let snapshot = controller.snapshot();

        assert_eq!(controller.current_ceiling(), 500);
        assert_eq!(snapshot.ceiling, 500);
        assert_eq!(snapshot.limiter.ceiling(), 500);
        assert_eq!(snapshot.version, 0);
    }

    #[test]
    fn test_set_ceiling_publishes_pair() {
        let controller = create_test_controller(500);

        controller.set_ceiling(100).unwrap();

        let snapshot = controller.snapshot();
        assert_eq!(controller.current_ceiling(), 100);
        assert_eq!(snapshot.ceiling, 100);
        assert_eq!(snapshot.limiter.ceiling(), 100);
        assert_eq!(snapshot.version, 1);
    }

    #[test]
    fn test_rejects_non_positive_and_keeps_state() {
        let controller = create_test_controller(500);
        let before = controller.snapshot();

        for bad in [0, -5, i64::MIN] {
            let err = controller.set_ceiling(bad).unwrap_err();
            assert!(matches!(err, GatewayError::InvalidArgument(_)));
        }

        assert_eq!(controller.current_ceiling(), 500);
        assert!(Arc::ptr_eq(&before, &controller.snapshot()));
    }

    #[test]
    fn test_set_ceiling_str() {
        let controller = create_test_controller(500);

        controller.set_ceiling_str("100\n").unwrap();
        assert_eq!(controller.current_ceiling(), 100);

        for bad in ["abc", "", "1.5", "-5", "0", "12abc"] {
            assert!(controller.set_ceiling_str(bad).is_err(), "{:?} accepted", bad);
        }
        assert_eq!(controller.current_ceiling(), 100);
    }

    #[test]
    fn test_stale_snapshot_survives_update() {
        let controller = create_test_controller(500);
        let stale = controller.snapshot();

        controller.set_ceiling(7).unwrap();

        assert_eq!(stale.ceiling, 500);
        assert_eq!(stale.limiter.ceiling(), 500);
        assert_eq!(controller.snapshot().limiter.ceiling(), 7);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_pairs() {
        let controller = Arc::new(create_test_controller(1));

        let writer = {
            let controller = controller.clone();
            std::thread::spawn(move || {
                for ceiling in 2..2_000 {
                    controller.set_ceiling(ceiling).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let controller = controller.clone();
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snapshot = controller.snapshot();
                        assert_eq!(snapshot.ceiling, snapshot.limiter.ceiling());
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(controller.current_ceiling(), 1_999);
        assert_eq!(controller.snapshot().version, 1_998);
    }
}
