// ABOUTME: Node configuration loaded from KEELSON_* environment variables.
// ABOUTME: Validates timings so a heartbeat can never expire between two polls of a live node.

use std::path::PathBuf;
use std::time::Duration;

use keelson_core::HighAvailabilityMode;
use keelson_rebind::RebindFailureMode;
use thiserror::Error;
use ulid::Ulid;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not valid: {value}")]
    Invalid { var: &'static str, value: String },

    #[error("heartbeat timeout ({timeout_ms}ms) must be longer than the poll period ({poll_ms}ms)")]
    TimeoutNotAbovePollPeriod { timeout_ms: u64, poll_ms: u64 },
}

/// Configuration for one management node.
#[derive(Debug, Clone)]
pub struct HaConfig {
    pub home: PathBuf,
    pub node_id: String,
    pub mode: HighAvailabilityMode,
    pub poll_period: Duration,
    pub heartbeat_timeout: Duration,
    pub persist_period: Duration,
    pub failure_mode: RebindFailureMode,
}

impl HaConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - KEELSON_HOME: persistence directory (default: ~/.keelson)
    /// - KEELSON_NODE_ID: this node's id (default: a fresh ULID)
    /// - KEELSON_HA_MODE: auto, master, standby, hot-standby, disabled (default: auto)
    /// - KEELSON_POLL_PERIOD_MS: election poll period (default: 5000)
    /// - KEELSON_HEARTBEAT_TIMEOUT_MS: heartbeat age at which a node is expired (default: 30000)
    /// - KEELSON_PERSIST_PERIOD_MS: delta flush period while master (default: 1000)
    /// - KEELSON_REBIND_FAILURE_MODE: fail-fast, continue, fail-at-end (default: fail-at-end)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
    }

    /// Same as [`HaConfig::from_env`] but reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let home = lookup("KEELSON_HOME").map(PathBuf::from).unwrap_or_else(|| {
            lookup("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".keelson")
        });

        let node_id = lookup("KEELSON_NODE_ID").unwrap_or_else(|| Ulid::new().to_string());

        let mode = match lookup("KEELSON_HA_MODE") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: "KEELSON_HA_MODE",
                value,
            })?,
            None => HighAvailabilityMode::Auto,
        };

        let poll_period = millis(&lookup, "KEELSON_POLL_PERIOD_MS", 5_000)?;
        let heartbeat_timeout = millis(&lookup, "KEELSON_HEARTBEAT_TIMEOUT_MS", 30_000)?;
        let persist_period = millis(&lookup, "KEELSON_PERSIST_PERIOD_MS", 1_000)?;

        let failure_mode = match lookup("KEELSON_REBIND_FAILURE_MODE") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: "KEELSON_REBIND_FAILURE_MODE",
                value,
            })?,
            None => RebindFailureMode::FailAtEnd,
        };

        let config = Self {
            home,
            node_id,
            mode,
            poll_period,
            heartbeat_timeout,
            persist_period,
            failure_mode,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout <= self.poll_period {
            return Err(ConfigError::TimeoutNotAbovePollPeriod {
                timeout_ms: self.heartbeat_timeout.as_millis() as u64,
                poll_ms: self.poll_period.as_millis() as u64,
            });
        }
        for (var, value) in [
            ("KEELSON_POLL_PERIOD_MS", self.poll_period),
            ("KEELSON_PERSIST_PERIOD_MS", self.persist_period),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    var,
                    value: "0".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(Duration::from_millis(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<HaConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HaConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = from_pairs(&[("HOME", "/home/op")]).unwrap();

        assert_eq!(config.home, PathBuf::from("/home/op/.keelson"));
        assert_eq!(config.mode, HighAvailabilityMode::Auto);
        assert_eq!(config.poll_period, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.persist_period, Duration::from_secs(1));
        assert_eq!(config.failure_mode, RebindFailureMode::FailAtEnd);
        assert_eq!(config.node_id.len(), 26, "default node id is a ULID");
    }

    #[test]
    fn explicit_values_are_used() {
        let config = from_pairs(&[
            ("KEELSON_HOME", "/var/lib/keelson"),
            ("KEELSON_NODE_ID", "n1"),
            ("KEELSON_HA_MODE", "hot_standby"),
            ("KEELSON_POLL_PERIOD_MS", "10"),
            ("KEELSON_HEARTBEAT_TIMEOUT_MS", "30000"),
            ("KEELSON_REBIND_FAILURE_MODE", "continue"),
        ])
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/var/lib/keelson"));
        assert_eq!(config.node_id, "n1");
        assert_eq!(config.mode, HighAvailabilityMode::HotStandby);
        assert_eq!(config.poll_period, Duration::from_millis(10));
        assert_eq!(config.failure_mode, RebindFailureMode::Continue);
    }

    #[test]
    fn timeout_must_exceed_poll_period() {
        let err = from_pairs(&[
            ("KEELSON_POLL_PERIOD_MS", "5000"),
            ("KEELSON_HEARTBEAT_TIMEOUT_MS", "5000"),
        ])
        .unwrap_err();

        assert!(matches!(err, ConfigError::TimeoutNotAbovePollPeriod { .. }));
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = from_pairs(&[("KEELSON_POLL_PERIOD_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("KEELSON_POLL_PERIOD_MS"));

        let err = from_pairs(&[("KEELSON_HA_MODE", "leader")]).unwrap_err();
        assert!(err.to_string().contains("KEELSON_HA_MODE"));

        let err = from_pairs(&[("KEELSON_PERSIST_PERIOD_MS", "0")]).unwrap_err();
        assert!(err.to_string().contains("KEELSON_PERSIST_PERIOD_MS"));
    }

    #[test]
    fn from_env_reads_the_process_environment() {
        // SAFETY: test-only code; no other test touches this variable
        unsafe {
            std::env::set_var("KEELSON_NODE_ID", "env-node");
        }
        let config = HaConfig::from_env();
        // SAFETY: test-only code
        unsafe {
            std::env::remove_var("KEELSON_NODE_ID");
        }

        assert_eq!(config.unwrap().node_id, "env-node");
    }
}
