//! Small shared utilities.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds in one hour.
pub(crate) const HOUR_MS: u64 = 3_600_000;

/// Current wall-clock time as epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Hour-of-day (0-23, UTC) for an epoch-millisecond timestamp.
pub(crate) fn hour_of_day(timestamp_ms: u64) -> u8 {
    ((timestamp_ms / HOUR_MS) % 24) as u8
}

/// Mean of a slice, 0.0 when empty.
pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_empty_is_zero() {
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn test_mean_simple() {
        assert!((mean(&[1.0, 2.0, 3.0]) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_hour_of_day_wraps() {
        // 25 hours past epoch is 01:00 UTC
        assert_eq!(hour_of_day(25 * HOUR_MS), 1);
    }
}
