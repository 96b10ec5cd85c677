//! Distributor and messaging configuration.
//!
//! All durations are milliseconds. Values come from, in increasing
//! precedence: [`Default`], a YAML document ([`DistributorConfig::from_yaml_str`])
//! and the `AGENT_BB_*` environment variables
//! ([`DistributorConfig::with_env_overrides`]).

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const ENV_CHECKPOINT_MAX_MS: &str = "AGENT_BB_CHECKPOINT_MAX_MS";
pub const ENV_LAZY_CHECKPOINT_MS: &str = "AGENT_BB_LAZY_CHECKPOINT_MS";
pub const ENV_KEEP_ALIVE_MS: &str = "AGENT_BB_KEEP_ALIVE_MS";
pub const ENV_RETRANSMIT_SCHEDULE_MS: &str = "AGENT_BB_RETRANSMIT_SCHEDULE_MS";

/// Reliable-messaging knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Idle time after which a zero-directive keep-alive goes to a peer.
    pub keep_alive_interval: u64,
    /// Delay before each retransmission; the last entry repeats.
    pub retransmit_schedule: Vec<u64>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: 55_000,
            retransmit_schedule: vec![20_000, 20_000, 60_000, 120_000, 300_000],
        }
    }
}

impl MessagingConfig {
    /// Delay before retry number `retry` (0 = first resend).
    pub fn retry_delay(&self, retry: u32) -> i64 {
        let idx = (retry as usize).min(self.retransmit_schedule.len().saturating_sub(1));
        self.retransmit_schedule.get(idx).copied().unwrap_or(20_000) as i64
    }
}

/// Per-agent distributor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// A dirty epoch older than this is checkpointed.
    pub checkpoint_max_interval: u64,
    /// Upper bound on the age of a dirty epoch in lazy mode.
    pub lazy_checkpoint_interval: u64,
    /// Lazy mode: only checkpoint at `checkpoint_max_interval` when acks are
    /// waiting on durability.
    pub lazy_persistence: bool,
    /// Every n-th checkpoint is a full snapshot; the others are deltas.
    pub full_checkpoint_every: u32,
    /// Bound on the distribution fixed-point loop.
    pub max_distribution_rounds: u32,
    /// Capacity of the execution timer's parameter queue.
    pub timer_parameter_capacity: usize,
    pub messaging: MessagingConfig,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            checkpoint_max_interval: 37_000,
            lazy_checkpoint_interval: 300_000,
            lazy_persistence: false,
            full_checkpoint_every: 10,
            max_distribution_rounds: 1_000,
            timer_parameter_capacity: crate::timer::DEFAULT_PARAMETER_CAPACITY,
            messaging: MessagingConfig::default(),
        }
    }
}

impl DistributorConfig {
    /// Parse a YAML document; missing keys keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden from the process environment.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `AGENT_BB_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Unparseable values are
    /// logged and ignored.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse_millis(&lookup, ENV_CHECKPOINT_MAX_MS) {
            self.checkpoint_max_interval = v;
        }
        if let Some(v) = parse_millis(&lookup, ENV_LAZY_CHECKPOINT_MS) {
            self.lazy_checkpoint_interval = v;
        }
        if let Some(v) = parse_millis(&lookup, ENV_KEEP_ALIVE_MS) {
            self.messaging.keep_alive_interval = v;
        }
        if let Some(raw) = lookup(ENV_RETRANSMIT_SCHEDULE_MS) {
            match parse_schedule(&raw) {
                Ok(schedule) => self.messaging.retransmit_schedule = schedule,
                Err(e) => log::warn!("Ignoring {}: {}", ENV_RETRANSMIT_SCHEDULE_MS, e),
            }
        }
        self
    }

    /// Reject configurations the distributor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.messaging.retransmit_schedule.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "messaging.retransmit_schedule".into(),
                message: "must not be empty".into(),
            });
        }
        if self.max_distribution_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_distribution_rounds".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.full_checkpoint_every == 0 {
            return Err(ConfigError::InvalidValue {
                key: "full_checkpoint_every".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}

fn parse_schedule(raw: &str) -> Result<Vec<u64>, ConfigError> {
    let schedule = raw
        .split(',')
        .map(|part| part.trim().parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::InvalidValue {
            key: ENV_RETRANSMIT_SCHEDULE_MS.into(),
            message: e.to_string(),
        })?;
    if schedule.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: ENV_RETRANSMIT_SCHEDULE_MS.into(),
            message: "must not be empty".into(),
        });
    }
    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = DistributorConfig::default();
        assert_eq!(config.checkpoint_max_interval, 37_000);
        assert_eq!(config.lazy_checkpoint_interval, 300_000);
        assert_eq!(config.messaging.keep_alive_interval, 55_000);
        assert_eq!(config.messaging.retry_delay(0), 20_000);
        assert_eq!(config.messaging.retry_delay(4), 300_000);
        assert_eq!(config.messaging.retry_delay(40), 300_000);
        assert_eq!(config.timer_parameter_capacity, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_partial() {
        let yaml = "checkpoint_max_interval: 1000\nmessaging:\n  keep_alive_interval: 500\n";
        let config = DistributorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.checkpoint_max_interval, 1_000);
        assert_eq!(config.messaging.keep_alive_interval, 500);
        assert_eq!(config.messaging.retransmit_schedule.len(), 5);
        assert_eq!(config.lazy_checkpoint_interval, 300_000);
    }

    #[test]
    fn test_yaml_rejects_empty_schedule() {
        let yaml = "messaging:\n  retransmit_schedule: []\n";
        assert!(matches!(
            DistributorConfig::from_yaml_str(yaml),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_CHECKPOINT_MAX_MS, "250"),
            (ENV_KEEP_ALIVE_MS, "not-a-number"),
            (ENV_RETRANSMIT_SCHEDULE_MS, "10, 20,40"),
        ]
        .into_iter()
        .collect();
        let config = DistributorConfig::default()
            .with_overrides_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.checkpoint_max_interval, 250);
        assert_eq!(config.messaging.keep_alive_interval, 55_000);
        assert_eq!(config.messaging.retransmit_schedule, vec![10, 20, 40]);
    }
}
