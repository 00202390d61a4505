//! Exponential backoff with jitter for session reconnection.

use std::time::Duration;

use rand::Rng;

pub const BASE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// `min(max, base * 2^attempt)` with ±25% jitter. Attempt 0 is the first
/// retry: roughly 1s, 2s, 4s, ... capped at 60s.
pub fn backoff(attempt: u32) -> Duration {
    backoff_with(BASE_DELAY, MAX_DELAY, attempt)
}

pub fn backoff_with(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.min(i32::MAX as u32) as i32);
    let capped = exp.min(max.as_secs_f64());

    let jitter = capped * 0.25 * rand::thread_rng().gen_range(-1.0..=1.0);
    Duration::from_secs_f64((capped + jitter).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_stays_within_jitter_envelope() {
        for attempt in 0..12u32 {
            let nominal = (2f64.powi(attempt as i32)).min(60.0);
            for _ in 0..50 {
                let delay = backoff(attempt).as_secs_f64();
                assert!(
                    delay >= nominal * 0.75 - 1e-9 && delay <= nominal * 1.25 + 1e-9,
                    "attempt {}: delay {}s outside [{}, {}]",
                    attempt,
                    delay,
                    nominal * 0.75,
                    nominal * 1.25
                );
            }
        }
    }

    #[test]
    fn test_backoff_caps_at_max() {
        for _ in 0..50 {
            let delay = backoff(30).as_secs_f64();
            assert!((45.0..=75.0).contains(&delay));
        }
        // Very large attempts must not overflow
        let delay = backoff(u32::MAX).as_secs_f64();
        assert!((45.0..=75.0).contains(&delay));
    }

    #[test]
    fn test_backoff_sequence_roughly_doubles() {
        // Nominal values (ignoring jitter): 1, 2, 4
        assert!((0.75..=1.25).contains(&backoff(0).as_secs_f64()));
        assert!((1.5..=2.5).contains(&backoff(1).as_secs_f64()));
        assert!((3.0..=5.0).contains(&backoff(2).as_secs_f64()));
    }
}
