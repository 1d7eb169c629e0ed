//! Runtime settings read from `DUEBILL_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::{BackoffPolicy, BackoffStrategy, DispatcherConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
}

/// Settings of one billing core process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub dispatcher_name: String,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub handler_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Ceiling on payment attempts, the original charge included.
    pub payment_max_attempts: u32,
    pub retry_policy: String,
    /// Overdue configuration loaded at start. Without one every account stays clear.
    pub state_set_path: Option<PathBuf>,
    pub max_conflict_retries: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        Self {
            dispatcher_name: dispatcher.name,
            poll_interval: dispatcher.poll_interval,
            lease_duration: dispatcher.lease_duration,
            batch_size: dispatcher.batch_size,
            max_concurrent: dispatcher.max_concurrent,
            handler_timeout: dispatcher.handler_timeout,
            backoff: dispatcher.backoff,
            payment_max_attempts: 4,
            retry_policy: "invoice".to_string(),
            state_set_path: None,
            max_conflict_retries: 5,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigLoadError> {
        let mut config = Self::default();
        let env = Lookup(&lookup);

        if let Some(name) = env.string("DUEBILL_DISPATCHER_NAME") {
            config.dispatcher_name = name;
        }
        if let Some(ms) = env.parse::<u64>("DUEBILL_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env.parse::<u64>("DUEBILL_LEASE_SECS")? {
            config.lease_duration = Duration::from_secs(secs);
        }
        if let Some(n) = env.positive("DUEBILL_BATCH_SIZE")? {
            config.batch_size = n;
        }
        if let Some(n) = env.positive("DUEBILL_MAX_CONCURRENT")? {
            config.max_concurrent = n;
        }
        if let Some(secs) = env.parse::<u64>("DUEBILL_HANDLER_TIMEOUT_SECS")? {
            config.handler_timeout = Duration::from_secs(secs);
        }

        let max_attempts = env
            .parse::<u32>("DUEBILL_MAX_ATTEMPTS")?
            .unwrap_or(config.backoff.max_attempts);
        let base = env
            .parse::<u64>("DUEBILL_BACKOFF_BASE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(config.backoff.base_delay);
        let max = env
            .parse::<u64>("DUEBILL_BACKOFF_MAX_MS")?
            .map(Duration::from_millis)
            .unwrap_or(config.backoff.max_delay);
        if max < base {
            return Err(ConfigLoadError::Invalid {
                key: "DUEBILL_BACKOFF_MAX_MS",
                value: max.as_millis().to_string(),
                reason: "must not be below DUEBILL_BACKOFF_BASE_MS".to_string(),
            });
        }
        let strategy = match env.string("DUEBILL_BACKOFF_STRATEGY") {
            Some(value) => BackoffStrategy::parse(&value).ok_or_else(|| ConfigLoadError::Invalid {
                key: "DUEBILL_BACKOFF_STRATEGY",
                value: value.clone(),
                reason: "expected fixed, linear or exponential".to_string(),
            })?,
            None => config.backoff.strategy,
        };
        config.backoff = match strategy {
            BackoffStrategy::Fixed => BackoffPolicy::fixed(max_attempts, base),
            other => BackoffPolicy::exponential(max_attempts, base, max).with_strategy(other),
        };

        if let Some(n) = env.parse::<u32>("DUEBILL_PAYMENT_MAX_ATTEMPTS")? {
            config.payment_max_attempts = n.max(1);
        }
        if let Some(policy) = env.string("DUEBILL_RETRY_POLICY") {
            config.retry_policy = policy;
        }
        config.state_set_path = env.string("DUEBILL_STATE_SET_PATH").map(PathBuf::from);
        if let Some(n) = env.parse::<u32>("DUEBILL_MAX_CONFLICT_RETRIES")? {
            config.max_conflict_retries = n;
        }

        Ok(config)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_name(self.dispatcher_name.clone())
            .with_poll_interval(self.poll_interval)
            .with_lease_duration(self.lease_duration)
            .with_batch_size(self.batch_size)
            .with_max_concurrent(self.max_concurrent)
            .with_handler_timeout(self.handler_timeout)
            .with_backoff(self.backoff.clone())
    }
}

struct Lookup<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    /// Non-blank value of `key`.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigLoadError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigLoadError::Invalid {
                    key,
                    value: value.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn positive(&self, key: &'static str) -> Result<Option<usize>, ConfigLoadError> {
        match self.parse::<usize>(key)? {
            Some(0) => Err(ConfigLoadError::Invalid {
                key,
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            }),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<CoreConfig, ConfigLoadError> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        CoreConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn unset_environment_yields_defaults() {
        let config = from_pairs(&[]).unwrap();
        let expected = CoreConfig {
            dispatcher_name: config.dispatcher_name.clone(),
            ..CoreConfig::default()
        };
        assert_eq!(config, expected);
        assert!(config.dispatcher_name.starts_with("dispatcher-"));
        assert_eq!(config.retry_policy, "invoice");
        assert!(config.state_set_path.is_none());
    }

    #[test]
    fn overrides_flow_into_dispatcher_config() {
        let config = from_pairs(&[
            ("DUEBILL_POLL_INTERVAL_MS", "250"),
            ("DUEBILL_BATCH_SIZE", "32"),
            ("DUEBILL_MAX_ATTEMPTS", "3"),
            ("DUEBILL_BACKOFF_BASE_MS", "1000"),
            ("DUEBILL_BACKOFF_MAX_MS", "8000"),
            ("DUEBILL_RETRY_POLICY", " fixed-schedule "),
            ("DUEBILL_STATE_SET_PATH", "/etc/duebill/overdue.json"),
        ])
        .unwrap();

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.poll_interval, Duration::from_millis(250));
        assert_eq!(dispatcher.batch_size, 32);
        assert_eq!(dispatcher.backoff.max_attempts, 3);
        assert_eq!(dispatcher.backoff.max_delay, Duration::from_secs(8));
        assert_eq!(config.retry_policy, "fixed-schedule");
        assert_eq!(config.state_set_path, Some(PathBuf::from("/etc/duebill/overdue.json")));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = from_pairs(&[("DUEBILL_LEASE_SECS", "five")]).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Invalid { key: "DUEBILL_LEASE_SECS", .. }));

        assert!(from_pairs(&[("DUEBILL_MAX_CONCURRENT", "0")]).is_err());
        let inverted = [("DUEBILL_BACKOFF_BASE_MS", "5000"), ("DUEBILL_BACKOFF_MAX_MS", "10")];
        assert!(from_pairs(&inverted).is_err());

        let err = from_pairs(&[("DUEBILL_BACKOFF_STRATEGY", "random")]).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Invalid { key: "DUEBILL_BACKOFF_STRATEGY", .. }));
    }

    #[test]
    fn backoff_strategy_selects_the_delay_curve() {
        let linear = from_pairs(&[
            ("DUEBILL_BACKOFF_STRATEGY", "Linear"),
            ("DUEBILL_BACKOFF_BASE_MS", "1000"),
            ("DUEBILL_BACKOFF_MAX_MS", "60000"),
        ])
        .unwrap()
        .dispatcher_config()
        .backoff;
        assert_eq!(linear.strategy, BackoffStrategy::Linear);
        assert_eq!(linear.delay_for_attempt(3), Duration::from_secs(3));

        let fixed = from_pairs(&[
            ("DUEBILL_BACKOFF_STRATEGY", "fixed"),
            ("DUEBILL_BACKOFF_BASE_MS", "2000"),
        ])
        .unwrap()
        .backoff;
        assert_eq!(fixed.strategy, BackoffStrategy::Fixed);
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(fixed.delay_for_attempt(4), Duration::from_secs(2));

        let default = from_pairs(&[]).unwrap().backoff;
        assert_eq!(default.strategy, BackoffStrategy::Exponential);
    }
}
