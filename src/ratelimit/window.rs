//! Sliding rate window subdivided into fixed slices.

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Default length of a rate window.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);
/// Default number of slices a window is split into.
pub const DEFAULT_GRANULARITY: u32 = 100;

/// A rate window of `period` split into `granularity` slices.
///
/// Counts are kept per slice and the window total is the sum of the most
/// recent `granularity` slices, so the window slides forward one slice at a
/// time instead of resetting all at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlidingWindow {
    period: Duration,
    granularity: u32,
}

impl SlidingWindow {
    /// Create a new window, rejecting a zero period or granularity.
    pub fn new(period: Duration, granularity: u32) -> Result<Self> {
        if period.is_zero() {
            return Err(GatewayError::InvalidArgument(
                "window period must be greater than 0".to_string(),
            ));
        }
        if granularity == 0 {
            return Err(GatewayError::InvalidArgument(
                "window granularity must be greater than 0".to_string(),
            ));
        }
        if u128::from(granularity) > period.as_millis() {
            return Err(GatewayError::InvalidArgument(format!(
                "window of {:?} cannot be split into {} slices of at least 1ms",
                period, granularity
            )));
        }
        Ok(Self {
            period,
            granularity,
        })
    }

    /// Total length of the window.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of slices in the window.
    pub fn granularity(&self) -> u32 {
        self.granularity
    }

    /// Length of one slice, rounded down to whole milliseconds.
    pub fn slice(&self) -> Duration {
        Duration::from_millis(self.slice_millis())
    }

    /// Index of the slice containing the given instant (in milliseconds).
    pub fn bucket_at(&self, millis: u64) -> u64 {
        millis / self.slice_millis()
    }

    /// Number of slices needed to cover the whole period.
    ///
    /// Equal to the granularity unless the period does not divide evenly
    /// into milliseconds, in which case one more slice is kept.
    pub fn span(&self) -> u64 {
        (self.period.as_millis() as u64).div_ceil(self.slice_millis())
    }

    /// The slices that make up the window ending at `current`.
    pub fn active_buckets(&self, current: u64) -> RangeInclusive<u64> {
        current.saturating_sub(self.span() - 1)..=current
    }

    /// Whether a slice has slid out of the window ending at `current`.
    pub fn is_stale(&self, bucket: u64, current: u64) -> bool {
        bucket < *self.active_buckets(current).start()
    }

    fn slice_millis(&self) -> u64 {
        ((self.period / self.granularity).as_millis() as u64).max(1)
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            granularity: DEFAULT_GRANULARITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_window() {
        let window = SlidingWindow::default();
        assert_eq!(window.period(), Duration::from_secs(1));
        assert_eq!(window.granularity(), 100);
        assert_eq!(window.slice(), Duration::from_millis(10));
    }

    #[test]
    fn test_rejects_zero_values() {
        assert!(SlidingWindow::new(Duration::ZERO, 10).is_err());
        assert!(SlidingWindow::new(Duration::from_secs(1), 0).is_err());
    }

    #[test]
    fn test_rejects_slices_below_a_millisecond() {
        assert!(SlidingWindow::new(Duration::from_millis(50), 100).is_err());
        assert!(SlidingWindow::new(Duration::from_micros(999), 1).is_err());

        let window = SlidingWindow::new(Duration::from_millis(100), 100).unwrap();
        assert_eq!(window.slice(), Duration::from_millis(1));
        assert_eq!(window.span(), 100);
    }

    #[test]
    fn test_uneven_slices_still_cover_period() {
        // 1000ms / 300 rounds down to 3ms slices; 334 of them cover the period
        let window = SlidingWindow::new(Duration::from_secs(1), 300).unwrap();
        assert_eq!(window.slice(), Duration::from_millis(3));
        assert_eq!(window.span(), 334);
        assert_eq!(window.active_buckets(1_000).count(), 334);
    }

    #[test]
    fn test_short_window_expires_on_time() {
        let window = SlidingWindow::new(Duration::from_millis(50), 10).unwrap();
        let hit = window.bucket_at(0);

        assert!(!window.is_stale(hit, window.bucket_at(49)));
        assert!(window.is_stale(hit, window.bucket_at(80)));
    }

    #[test]
    fn test_bucket_and_active_range() {
        let window = SlidingWindow::default();
        assert_eq!(window.bucket_at(0), 0);
        assert_eq!(window.bucket_at(1_234), 123);

        let range = window.active_buckets(123);
        assert_eq!(*range.start(), 24);
        assert_eq!(*range.end(), 123);
        assert_eq!(range.count(), 100);

        assert!(window.is_stale(23, 123));
        assert!(!window.is_stale(24, 123));
    }

    #[test]
    fn test_active_range_near_zero() {
        let window = SlidingWindow::default();
        let range = window.active_buckets(5);
        assert_eq!(*range.start(), 0);
        assert_eq!(*range.end(), 5);
    }
}
