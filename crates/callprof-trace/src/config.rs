//! Session configuration and environment parsing.

use std::time::Duration;
use thiserror::Error;

/// Harvest interval override
pub const INTERVAL_ENV: &str = "CALLPROF_INTERVAL";

/// Channel write timeout override
pub const WRITE_TIMEOUT_ENV: &str = "CALLPROF_WRITE_TIMEOUT";

/// Pending snapshot bound; setting it switches to the buffering policy
pub const MAX_PENDING_ENV: &str = "CALLPROF_MAX_PENDING";

/// What to do with a snapshot the channel cannot take right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Drop it and count the loss
    Drop,
    /// Keep up to `max_pending` snapshots and retry on the next tick,
    /// dropping the oldest when full
    Buffer { max_pending: usize },
}

/// What each harvested payload contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestMode {
    /// Only what accumulated since the previous harvest
    Incremental,
    /// Everything since the session started or was last cleared
    Cumulative,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Time between periodic harvests
    pub harvest_interval: Duration,
    /// Longest a single channel write may wait
    pub write_timeout: Duration,
    /// Longest to wait for the consumer's handshake reply
    pub handshake_timeout: Duration,
    /// Time allowed for the last harvest when the process is exiting
    pub final_flush_budget: Duration,
    /// How often the worker checks for local requests between harvests
    pub poll_interval: Duration,
    pub delivery: DeliveryPolicy,
    pub harvest_mode: HarvestMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            harvest_interval: Duration::from_secs(1),
            write_timeout: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(5),
            final_flush_budget: Duration::from_millis(500),
            poll_interval: Duration::from_millis(50),
            delivery: DeliveryPolicy::Drop,
            harvest_mode: HarvestMode::Incremental,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} is not set")]
    Missing(&'static str),
}

impl SessionConfig {
    /// Defaults overridden by `CALLPROF_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(INTERVAL_ENV) {
            config.harvest_interval = parse_env_duration(INTERVAL_ENV, &value)?;
        }
        if let Some(value) = lookup(WRITE_TIMEOUT_ENV) {
            config.write_timeout = parse_env_duration(WRITE_TIMEOUT_ENV, &value)?;
        }
        if let Some(value) = lookup(MAX_PENDING_ENV) {
            let max_pending = value.trim().parse::<usize>().map_err(|e| ConfigError::InvalidValue {
                var: MAX_PENDING_ENV,
                value: value.clone(),
                reason: e.to_string(),
            })?;
            config.delivery = DeliveryPolicy::Buffer { max_pending };
        }

        Ok(config)
    }
}

fn parse_env_duration(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let duration = parse_duration(value).map_err(|reason| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason,
    })?;
    if duration.is_zero() {
        return Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(duration)
}

/// Parse a human duration ("250ms", "1m30s") or a bare number of seconds
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    Err(format!(
        "Invalid duration '{}'. Examples: 250ms, 30s, 5m, 1h30m, 90",
        s
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        assert_eq!(
            SessionConfig::from_lookup(lookup(&[])).unwrap(),
            SessionConfig::default()
        );
    }

    #[test]
    fn test_env_overrides() {
        let config = SessionConfig::from_lookup(lookup(&[
            (INTERVAL_ENV, "250ms"),
            (WRITE_TIMEOUT_ENV, "2"),
            (MAX_PENDING_ENV, "8"),
        ]))
        .unwrap();

        assert_eq!(config.harvest_interval, Duration::from_millis(250));
        assert_eq!(config.write_timeout, Duration::from_secs(2));
        assert_eq!(config.delivery, DeliveryPolicy::Buffer { max_pending: 8 });
    }

    #[test]
    fn test_invalid_env_values() {
        let err = SessionConfig::from_lookup(lookup(&[(INTERVAL_ENV, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: INTERVAL_ENV, .. }));

        let err = SessionConfig::from_lookup(lookup(&[(INTERVAL_ENV, "0s")])).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));

        let err = SessionConfig::from_lookup(lookup(&[(MAX_PENDING_ENV, "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: MAX_PENDING_ENV, .. }));
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("later").is_err());
    }
}
