// Wall-clock seconds — every protocol timer runs on this granularity

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in whole seconds.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns true once `interval` seconds have elapsed since `timestamp`.
///
/// A zero timestamp is treated as "never", so fresh timers fire immediately.
pub fn is_timeout(timestamp: u64, interval: u64) -> bool {
    timestamp.saturating_add(interval) <= unix_time()
}

/// Variant of [`is_timeout`] against an explicit clock reading, for code that
/// samples the clock once per tick.
pub fn is_timeout_at(now: u64, timestamp: u64, interval: u64) -> bool {
    timestamp.saturating_add(interval) <= now
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_time_is_sane() {
        // Anything before 2020 means the clock is broken
        assert!(unix_time() > 1_577_836_800);
    }

    #[test]
    fn test_timeout_elapsed() {
        let now = unix_time();
        assert!(is_timeout(now - 10, 5));
        assert!(!is_timeout(now, 5));
    }

    #[test]
    fn test_timeout_at_boundary() {
        assert!(is_timeout_at(100, 90, 10));
        assert!(!is_timeout_at(99, 90, 10));
        assert!(is_timeout_at(100, 0, 5));
    }

    #[test]
    fn test_timeout_no_overflow() {
        assert!(!is_timeout_at(100, u64::MAX - 3, 10));
    }
}
