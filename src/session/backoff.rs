//! Reconnect backoff policy
//!
//! Pure function so the policy is testable without timers or sockets.

use std::time::Duration;

/// Delay before reconnect attempt number `attempt` (0-based).
///
/// `min(base * 2^attempt, cap)`. Saturates instead of overflowing for
/// absurd attempt counts; the connection never gives up, so `attempt` can
/// grow without bound.
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let delay_ms = (base.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(delay_ms).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(1_000);
    const CAP: Duration = Duration::from_millis(30_000);

    #[test]
    fn test_doubles_per_attempt() {
        assert_eq!(reconnect_delay(0, BASE, CAP), Duration::from_millis(1_000));
        assert_eq!(reconnect_delay(1, BASE, CAP), Duration::from_millis(2_000));
        assert_eq!(reconnect_delay(2, BASE, CAP), Duration::from_millis(4_000));
        assert_eq!(reconnect_delay(3, BASE, CAP), Duration::from_millis(8_000));
        assert_eq!(reconnect_delay(4, BASE, CAP), Duration::from_millis(16_000));
    }

    #[test]
    fn test_capped_at_max() {
        assert_eq!(reconnect_delay(5, BASE, CAP), CAP);
        assert_eq!(reconnect_delay(10, BASE, CAP), CAP);
    }

    #[test]
    fn test_no_overflow_on_huge_attempt_counts() {
        assert_eq!(reconnect_delay(63, BASE, CAP), CAP);
        assert_eq!(reconnect_delay(64, BASE, CAP), CAP);
        assert_eq!(reconnect_delay(u32::MAX, BASE, CAP), CAP);
    }

    #[test]
    fn test_respects_custom_base() {
        let base = Duration::from_millis(10);
        let cap = Duration::from_millis(100);
        assert_eq!(reconnect_delay(0, base, cap), Duration::from_millis(10));
        assert_eq!(reconnect_delay(3, base, cap), Duration::from_millis(80));
        assert_eq!(reconnect_delay(4, base, cap), cap);
    }
}
