//! Exponential backoff with optional jitter.

use rand::Rng;
use std::time::Duration;

/// Delay before retrying after `attempt` (1-based) failed.
///
/// `min(max_ms, base_ms * multiplier^(attempt - 1))`, zero for attempt 0.
pub fn calculate_backoff(attempt: u32, base_ms: u64, multiplier: f64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay_ms = base_ms as f64 * multiplier.powi(exponent);
    let capped_delay = delay_ms.min(max_ms as f64);

    Duration::from_millis(capped_delay as u64)
}

/// Apply jitter (0 to 10% of the delay).
pub fn with_jitter(delay: Duration) -> Duration {
    let delay_ms = delay.as_millis() as u64;
    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(delay_ms + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, 100, 2.0, 2000), Duration::ZERO);
        assert_eq!(calculate_backoff(1, 100, 2.0, 2000), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, 100, 2.0, 2000), Duration::from_millis(200));
        assert_eq!(calculate_backoff(3, 100, 2.0, 2000), Duration::from_millis(400));

        let max = calculate_backoff(10, 100, 2.0, 1000);
        assert_eq!(max, Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let d = calculate_backoff(u32::MAX, 100, 3.0, 5000);
        assert_eq!(d, Duration::from_millis(5000));
    }

    #[test]
    fn test_flat_multiplier() {
        assert_eq!(calculate_backoff(5, 250, 1.0, 2000), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = with_jitter(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(1000));
            assert!(d < Duration::from_millis(1100));
        }
        assert_eq!(with_jitter(Duration::from_millis(5)), Duration::from_millis(5));
    }
}
