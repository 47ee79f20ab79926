//! Run-level settings: concurrency budget, default timeout, retry policy
//!
//! Durations deserialize from strings like "250ms", "30s", "5m", "1h"
//! (a bare number is seconds).

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Default concurrency budget when the graph does not set one
pub const DEFAULT_CONCURRENCY: usize = 8;
/// Default per-attempt timeout (60 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default base delay between retry attempts (1 second)
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Default cap on the backoff delay (30 seconds)
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Parse a duration string like "30s", "5m", "1h" into a Duration
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let s = duration_str.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    if let Some(hours) = s.strip_suffix('h') {
        return hours
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600));
    }

    s.parse::<u64>().ok().map(Duration::from_secs)
}

pub(crate) fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: '{s}'")))
}

pub(crate) fn de_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s {
        None => Ok(None),
        Some(s) => parse_duration(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: '{s}'"))),
    }
}

/// Retry policy applied to nodes that do not override it
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once)
    #[serde(default)]
    pub max_retries: u32,

    /// Base backoff delay; attempt n waits base * 2^n, capped at max_delay
    #[serde(default = "default_base_delay", deserialize_with = "de_duration")]
    pub base_delay: Duration,

    /// Upper bound on the backoff delay
    #[serde(default = "default_max_delay", deserialize_with = "de_duration")]
    pub max_delay: Duration,
}

fn default_base_delay() -> Duration {
    DEFAULT_BASE_DELAY
}

fn default_max_delay() -> Duration {
    DEFAULT_MAX_DELAY
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry `attempt` (1-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16); // 2^16s already dwarfs any sane max_delay
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Run-level execution settings for one graph
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    /// Maximum number of nodes holding `running` status at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-attempt timeout for nodes that do not set their own
    #[serde(default = "default_timeout", deserialize_with = "de_duration")]
    pub default_timeout: Duration,

    /// Retry policy for nodes that do not set their own retry count
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            default_timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl RunSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidSettings {
                reason: "concurrency must be positive".to_string(),
            });
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::InvalidSettings {
                reason: format!(
                    "retry base_delay {:?} exceeds max_delay {:?}",
                    self.retry.base_delay, self.retry.max_delay
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_suffixes() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("42"), Some(Duration::from_secs(42)));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("fast"), None);
        assert_eq!(parse_duration("5x"), None);
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: RunSettings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings, RunSettings::default());
        assert_eq!(settings.concurrency, DEFAULT_CONCURRENCY);
    }

    #[test]
    fn settings_deserialize_duration_strings() {
        let yaml = r#"
concurrency: 2
default_timeout: 5s
retry:
  max_retries: 3
  base_delay: 100ms
  max_delay: 2s
"#;
        let settings: RunSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.concurrency, 2);
        assert_eq!(settings.default_timeout, Duration::from_secs(5));
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(100));
        assert_eq!(settings.retry.max_delay, Duration::from_secs(2));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let settings = RunSettings {
            concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidSettings { .. })
        ));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500)); // capped
        assert_eq!(policy.backoff(60), Duration::from_millis(500)); // no overflow
    }
}
