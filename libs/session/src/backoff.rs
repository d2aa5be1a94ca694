use std::{fmt, str::FromStr, time::Duration};

use rand::{Rng, rng};
use serde::{Deserialize, Serialize};

const MAX_EXPONENT: u32 = 16;
// jitter adds at most 1/JITTER_DIVISOR of the computed delay
const JITTER_DIVISOR: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => f.write_str("fixed"),
            Self::Exponential => f.write_str("exponential"),
        }
    }
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" | "exp" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff strategy `{other}`")),
        }
    }
}

/// How long to wait between reconnect attempts and when to give up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
            ..Self::default()
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether reconnect number `attempt` (1-based) may still be made.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Delay before the reconnect that follows `attempt` earlier failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.max_delay.max(self.base_delay);
        let computed = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let pow = attempt.min(MAX_EXPONENT);
                self.base_delay.saturating_mul(1u32 << pow).min(self.max_delay)
            }
        };
        if !self.jitter {
            return computed;
        }

        let spread = (computed.as_millis() as u64) / JITTER_DIVISOR;
        if spread == 0 {
            return computed;
        }
        let extra = Duration::from_millis(rng().random_range(0..=spread));
        computed.saturating_add(extra).min(ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.strategy, BackoffStrategy::Exponential);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.max_attempts, None);
        assert!(policy.jitter);
    }

    #[test]
    fn exponential_doubles_until_capped() {
        let policy =
            ReconnectPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1))
                .without_jitter();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn fixed_ignores_attempt() {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(250)).without_jitter();
        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(9), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy =
            ReconnectPolicy::exponential(Duration::from_millis(1_000), Duration::from_secs(60));
        for attempt in 0..8 {
            let floor = policy.clone().without_jitter().delay(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay >= floor, "{delay:?} < {floor:?}");
                assert!(delay <= floor + floor / 5, "{delay:?} too large");
                assert!(delay <= policy.max_delay);
            }
        }
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy =
            ReconnectPolicy::exponential(Duration::from_millis(500), Duration::from_secs(2));
        for _ in 0..100 {
            assert!(policy.delay(10) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn max_attempts_bounds_retries() {
        let unbounded = ReconnectPolicy::default();
        assert!(unbounded.allows(u32::MAX));

        let bounded = ReconnectPolicy::default().with_max_attempts(3);
        assert!(bounded.allows(1));
        assert!(bounded.allows(3));
        assert!(!bounded.allows(4));
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!(
            "Fixed".parse::<BackoffStrategy>().ok(),
            Some(BackoffStrategy::Fixed)
        );
        assert_eq!(
            " exponential ".parse::<BackoffStrategy>().ok(),
            Some(BackoffStrategy::Exponential)
        );
        assert!("linear".parse::<BackoffStrategy>().is_err());
    }
}
