//! Retry budgets and backoff curves

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Cap applied when a fixed policy is turned into an exponential one
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(600);

/// Shape of the wait between two attempts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// The same wait before every retry
    Fixed {
        #[serde(with = "duration_millis")]
        interval: Duration,
    },
    /// `initial * coefficient^(n-1)` before the n-th retry, capped
    Exponential {
        #[serde(with = "duration_millis")]
        initial: Duration,
        coefficient: f64,
        #[serde(with = "duration_millis")]
        max_interval: Duration,
    },
}

impl Backoff {
    fn base_delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed { interval } => interval,
            Backoff::Exponential {
                initial,
                coefficient,
                max_interval,
            } => {
                let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = initial.as_secs_f64() * coefficient.powi(exponent);
                Duration::from_secs_f64(secs.min(max_interval.as_secs_f64()).max(0.0))
            }
        }
    }
}

/// How often and how patiently failed work is tried again
///
/// Jobs start with `max_retries` retries and, after each failure, become due
/// again once the backoff for that retry has passed. The same policy type
/// paces command re-runs after an optimistic lock conflict.
///
/// ```
/// use bpmflow_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_retries(5)
///     .with_initial_interval(Duration::from_secs(1));
///
/// assert_eq!(policy.max_retries, 5);
/// assert_eq!(policy.retry_delay(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries granted after the first failure
    pub max_retries: u32,

    pub backoff: Backoff,

    /// Relative spread (0.0-1.0) added to every delay; 0.1 is ±10%
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Three retries, 10s doubling up to 10 minutes, no jitter
    pub fn exponential() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(10),
                coefficient: 2.0,
                max_interval: DEFAULT_MAX_INTERVAL,
            },
            jitter: 0.0,
        }
    }

    pub fn fixed(interval: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { interval },
            jitter: 0.0,
        }
    }

    /// Failures are final
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO, 0)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// First wait of an exponential curve, or the constant wait of a fixed one
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        match &mut self.backoff {
            Backoff::Fixed { interval: current } => *current = interval,
            Backoff::Exponential { initial, .. } => *initial = interval,
        }
        self
    }

    /// Cap of an exponential curve; fixed policies ignore it
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        if let Backoff::Exponential { max_interval, .. } = &mut self.backoff {
            *max_interval = interval;
        }
        self
    }

    /// Switches a fixed policy to an exponential curve starting at its interval
    pub fn with_backoff_coefficient(mut self, factor: f64) -> Self {
        self.backoff = match self.backoff {
            Backoff::Fixed { interval } => Backoff::Exponential {
                initial: interval,
                coefficient: factor,
                max_interval: DEFAULT_MAX_INTERVAL.max(interval),
            },
            Backoff::Exponential {
                initial,
                max_interval,
                ..
            } => Backoff::Exponential {
                initial,
                coefficient: factor,
                max_interval,
            },
        };
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Wait before the `retry`-th retry (1-based)
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let base = self.backoff.base_delay(retry.max(1));
        // Deserialized or hand-set policies skip the builder's clamp
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }

    /// Wait before the next attempt of a job left with `retries_left`
    ///
    /// Retries raised above the budget by an administrator count as the
    /// first retry.
    pub fn backoff_for_remaining(&self, retries_left: u32) -> Duration {
        let used = self.max_retries.saturating_sub(retries_left);
        self.retry_delay(used.max(1))
    }

    /// Whether another retry is allowed after `retries_done` retries
    pub fn allows_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

/// `Duration` as integer milliseconds on the wire
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_curve_doubles_until_capped() {
        let policy = RetryPolicy::exponential()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(5));

        let delays: Vec<u64> = (1..=5).map(|n| policy.retry_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_fixed_curve_is_flat() {
        let policy = RetryPolicy::fixed(Duration::from_millis(250), 4);
        assert_eq!(policy.retry_delay(1), policy.retry_delay(4));
        assert_eq!(
            policy.with_max_interval(Duration::ZERO).retry_delay(2),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_coefficient_turns_fixed_into_exponential() {
        let policy = RetryPolicy::fixed(Duration::from_secs(2), 3).with_backoff_coefficient(3.0);
        assert_eq!(policy.retry_delay(1), Duration::from_secs(2));
        assert_eq!(policy.retry_delay(3), Duration::from_secs(18));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::fixed(Duration::from_secs(10), 3).with_jitter(0.1);

        for _ in 0..100 {
            let delay = policy.retry_delay(1);
            assert!(delay >= Duration::from_secs(9));
            assert!(delay <= Duration::from_secs(11));
        }
    }

    #[test]
    fn test_out_of_range_jitter_is_clamped_when_delaying() {
        let mut policy = RetryPolicy::fixed(Duration::from_secs(10), 3);
        policy.jitter = 5.0;
        for _ in 0..100 {
            assert!(policy.retry_delay(1) <= Duration::from_secs(20));
        }

        policy.jitter = f64::NAN;
        assert_eq!(policy.retry_delay(1), Duration::from_secs(10));

        let parsed: RetryPolicy = serde_json::from_str(
            r#"{"max_retries":1,"backoff":{"kind":"fixed","interval":1000},"jitter":-3.0}"#,
        )
        .unwrap();
        assert_eq!(parsed.retry_delay(1), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_grows_as_job_retries_drain() {
        let policy = RetryPolicy::exponential()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_retries(3);

        assert_eq!(policy.backoff_for_remaining(2), Duration::from_secs(1));
        assert_eq!(policy.backoff_for_remaining(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for_remaining(10), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_budget() {
        assert!(!RetryPolicy::no_retry().allows_retry(0));

        let policy = RetryPolicy::fixed(Duration::ZERO, 2);
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));
    }

    #[test]
    fn test_policy_json_shape() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1500), 2);
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["backoff"]["kind"], "fixed");
        assert_eq!(json["backoff"]["interval"], 1500);

        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }
}
