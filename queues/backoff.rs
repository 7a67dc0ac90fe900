use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry delay policy persisted with each job so any worker that claims it
/// computes the same schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// delay(n) = 2^(n-1) * base
    Exponential {
        #[serde(with = "millis")]
        base: Duration,
        #[serde(with = "opt_millis", default, skip_serializing_if = "Option::is_none")]
        max: Option<Duration>,
    },
    /// delay(n) = n * base
    Linear {
        #[serde(with = "millis")]
        base: Duration,
        #[serde(with = "opt_millis", default, skip_serializing_if = "Option::is_none")]
        max: Option<Duration>,
    },
    /// delay(n) = base
    Fixed {
        #[serde(with = "millis")]
        base: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            base: Duration::from_millis(1000),
            max: Some(Duration::from_millis(300_000)),
        }
    }
}

impl RetryPolicy {
    /// The delay to wait after the `attempt`-th failed attempt (1-based),
    /// before the cap and jitter are applied.
    fn raw_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            RetryPolicy::Exponential { base, .. } => {
                let factor = 2u32.saturating_pow(attempt - 1);
                base.saturating_mul(factor)
            }
            RetryPolicy::Linear { base, .. } => base.saturating_mul(attempt),
            RetryPolicy::Fixed { base } => *base,
        }
    }

    fn cap(&self) -> Option<Duration> {
        match self {
            RetryPolicy::Exponential { max, .. } | RetryPolicy::Linear { max, .. } => *max,
            RetryPolicy::Fixed { .. } => None,
        }
    }

    /// Capped delay for the given failed attempt count.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.raw_delay(attempt);
        match self.cap() {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Capped delay plus a uniform random jitter in [0, jitter_factor*delay).
    /// A non-positive factor disables jitter.
    pub fn delay_with_jitter(&self, attempt: u32, jitter_factor: f64) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if jitter_factor <= 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * jitter_factor;
        let jitter = rand::random::<f64>() * spread;
        delay + Duration::from_secs_f64(jitter)
    }
}

mod millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

mod opt_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles() {
        let policy = RetryPolicy::Exponential {
            base: Duration::from_millis(100),
            max: None,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_respects_cap() {
        let policy = RetryPolicy::Exponential {
            base: Duration::from_millis(100),
            max: Some(Duration::from_millis(250)),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        for attempt in 3..12 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn linear_scales_with_attempt() {
        let policy = RetryPolicy::Linear {
            base: Duration::from_millis(50),
            max: None,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(150));
    }

    #[test]
    fn fixed_never_changes() {
        let policy = RetryPolicy::Fixed {
            base: Duration::from_millis(75),
        };
        for attempt in 1..10 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(75));
        }
    }

    #[test]
    fn attempt_zero_is_treated_as_one() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), policy.delay_for_attempt(1));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy::Fixed {
            base: Duration::from_millis(1000),
        };
        for _ in 0..100 {
            let delay = policy.delay_with_jitter(1, 0.1);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay < Duration::from_millis(1101));
        }
        assert_eq!(
            policy.delay_with_jitter(1, 0.0),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn policy_serializes_as_millis() {
        let policy = RetryPolicy::Exponential {
            base: Duration::from_millis(1000),
            max: Some(Duration::from_millis(300_000)),
        };
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "exponential", "base": 1000, "max": 300000})
        );
        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }
}
