//! Retry scheduling for failed CRM writes.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

pub const DEFAULT_MAX_WRITE_RETRIES: u32 = 8;

const JITTER_FRACTION: f64 = 0.2;

/// The next retry attempt for a failed write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySchedule {
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
}

/// Compute the next retry for a write that has already failed `retry_count`
/// times.
///
/// Delay doubles per retry from the base delay, capped at the max delay,
/// with up to 20% jitter in either direction. The jittered delay never
/// drops below the base delay, so retries cannot stampede.
pub fn compute_retry_schedule(
    retry_count: u32,
    now: DateTime<Utc>,
    base_delay: std::time::Duration,
    max_delay: std::time::Duration,
) -> RetrySchedule {
    let base_secs = (base_delay.as_secs() as i64).max(1);
    let max_secs = (max_delay.as_secs() as i64).max(base_secs);
    let exponent = retry_count.min(30);
    let raw = base_secs.saturating_mul(1i64 << exponent);
    let capped = raw.min(max_secs);

    let mut rng = rand::thread_rng();
    let jitter = rng.gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
    let jittered = ((capped as f64) * (1.0 + jitter)) as i64;
    let delay_secs = jittered.max(base_secs);

    RetrySchedule {
        retry_count: retry_count + 1,
        next_retry_at: now + Duration::seconds(delay_secs),
    }
}

/// Whether a write has exhausted its retry budget.
pub fn is_permanent_failure(retry_count: u32, max_retries: u32) -> bool {
    retry_count >= max_retries
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration as StdDuration;

    fn delay_secs(retry_count: u32) -> i64 {
        let now = Utc::now();
        let schedule = compute_retry_schedule(
            retry_count,
            now,
            StdDuration::from_secs(60),
            StdDuration::from_secs(24 * 60 * 60),
        );
        (schedule.next_retry_at - now).num_seconds()
    }

    #[test]
    fn first_retry_is_near_base_delay() {
        for _ in 0..50 {
            let d = delay_secs(0);
            assert!((60..=72).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn delay_doubles_per_retry() {
        for _ in 0..50 {
            let d = delay_secs(3);
            // 480s nominal, +/- 20% jitter
            assert!((384..=576).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn delay_is_capped_at_one_day() {
        for _ in 0..50 {
            let d = delay_secs(20);
            assert!(d <= (86_400.0 * 1.2) as i64, "delay {d} above jittered cap");
            assert!(d >= 60);
        }
    }

    #[test]
    fn never_below_base_delay() {
        for retry in 0..10 {
            assert!(delay_secs(retry) >= 60);
        }
    }

    #[test]
    fn honors_configured_window() {
        let now = Utc::now();
        for _ in 0..50 {
            let first = compute_retry_schedule(
                0,
                now,
                StdDuration::from_secs(5),
                StdDuration::from_secs(10),
            );
            let d = (first.next_retry_at - now).num_seconds();
            assert!((5..=6).contains(&d), "delay {d} outside configured base");

            let capped = compute_retry_schedule(
                10,
                now,
                StdDuration::from_secs(5),
                StdDuration::from_secs(10),
            );
            let d = (capped.next_retry_at - now).num_seconds();
            assert!((5..=12).contains(&d), "delay {d} outside configured cap");
        }
    }

    #[test]
    fn increments_retry_count() {
        let schedule = compute_retry_schedule(
            4,
            Utc::now(),
            StdDuration::from_secs(60),
            StdDuration::from_secs(24 * 60 * 60),
        );
        assert_eq!(schedule.retry_count, 5);
    }

    #[test]
    fn permanent_failure_at_max() {
        // Callers pass the attempt about to be made (retry_count + 1), so a
        // record that has already failed 7 times is out of budget.
        assert!(!is_permanent_failure(6 + 1, DEFAULT_MAX_WRITE_RETRIES));
        assert!(is_permanent_failure(7 + 1, DEFAULT_MAX_WRITE_RETRIES));
        assert!(is_permanent_failure(8 + 1, DEFAULT_MAX_WRITE_RETRIES));
    }
}
