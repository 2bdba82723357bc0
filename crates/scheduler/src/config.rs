//! Scheduler configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use jobrun_core::ServerId;
use jobrun_infra::retry::{
    ExpBackoff, RetryableSend, RetryableTransaction, STD_SEND_RETRIES, STD_TX_RETRIES,
};
use jobrun_infra::workers::{ExecutorConfig, ReaperConfig};

pub const ENV_SERVER_ID: &str = "SCHEDULER_SERVER_ID";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_DB_MAX_CONNECTIONS: &str = "SCHEDULER_DB_MAX_CONNECTIONS";
pub const ENV_RUN_JOBS_LIMIT: &str = "SCHEDULER_RUN_JOBS_LIMIT";
pub const ENV_RUN_INTERVAL_SECS: &str = "SCHEDULER_RUN_INTERVAL_SECS";
pub const ENV_INTERRUPT_THRESHOLD_SECS: &str = "SCHEDULER_INTERRUPT_THRESHOLD_SECS";
pub const ENV_INTERRUPT_INTERVAL_SECS: &str = "SCHEDULER_INTERRUPT_INTERVAL_SECS";
pub const ENV_TX_RETRIES: &str = "SCHEDULER_TX_RETRIES";
pub const ENV_SEND_RETRIES: &str = "SCHEDULER_SEND_RETRIES";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub server_id: ServerId,
    /// `None` selects the in-memory store
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub run_jobs_limit: i32,
    pub run_interval: Duration,
    pub interrupt_threshold: Duration,
    pub interrupt_interval: Duration,
    pub tx_retries: u32,
    pub send_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            database_url: None,
            db_max_connections: 10,
            run_jobs_limit: 1,
            run_interval: Duration::from_secs(60),
            interrupt_threshold: Duration::from_secs(300),
            interrupt_interval: Duration::from_secs(60),
            tx_retries: STD_TX_RETRIES,
            send_retries: STD_SEND_RETRIES,
        }
    }
}

fn default_server_id() -> ServerId {
    ServerId::from(format!("scheduler-{}", uuid::Uuid::now_v7()))
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset and blank variables
    /// take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let config = Self {
            server_id: get(ENV_SERVER_ID)
                .map(ServerId::from)
                .unwrap_or(defaults.server_id),
            database_url: get(ENV_DATABASE_URL),
            db_max_connections: parse_or(&get, ENV_DB_MAX_CONNECTIONS, defaults.db_max_connections)?,
            run_jobs_limit: parse_or(&get, ENV_RUN_JOBS_LIMIT, defaults.run_jobs_limit)?,
            run_interval: secs_or(&get, ENV_RUN_INTERVAL_SECS, defaults.run_interval)?,
            interrupt_threshold: secs_or(
                &get,
                ENV_INTERRUPT_THRESHOLD_SECS,
                defaults.interrupt_threshold,
            )?,
            interrupt_interval: secs_or(
                &get,
                ENV_INTERRUPT_INTERVAL_SECS,
                defaults.interrupt_interval,
            )?,
            tx_retries: parse_or(&get, ENV_TX_RETRIES, defaults.tx_retries)?,
            send_retries: parse_or(&get, ENV_SEND_RETRIES, defaults.send_retries)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.run_jobs_limit < 1 {
            return Err(ConfigError::invalid(
                ENV_RUN_JOBS_LIMIT,
                &self.run_jobs_limit.to_string(),
                "must be at least 1",
            ));
        }
        if self.db_max_connections == 0 {
            return Err(ConfigError::invalid(ENV_DB_MAX_CONNECTIONS, "0", "must be at least 1"));
        }
        for (var, value) in [
            (ENV_RUN_INTERVAL_SECS, self.run_interval),
            (ENV_INTERRUPT_INTERVAL_SECS, self.interrupt_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(var, "0", "a zero period would spin"));
            }
        }
        Ok(())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::new(self.server_id.clone())
            .with_name(format!("run-executor-{}", self.server_id))
            .with_run_jobs_limit(self.run_jobs_limit)
            .with_poll_interval(self.run_interval)
    }

    /// The reaper reclaims stale runs of every server.
    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig::default()
            .with_threshold(self.interrupt_threshold)
            .with_interval(self.interrupt_interval)
    }

    pub fn retryable_transaction(&self) -> RetryableTransaction {
        RetryableTransaction::new(self.tx_retries, ExpBackoff::default())
    }

    pub fn retryable_send(&self) -> RetryableSend {
        RetryableSend::new(self.send_retries, ExpBackoff::default())
    }
}

fn parse_or<G, T>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(var, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn secs_or<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, var, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<SchedulerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SchedulerConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = load(&[]).unwrap();

        assert!(config.server_id.as_str().starts_with("scheduler-"));
        assert_eq!(config.database_url, None);
        assert_eq!(config.run_jobs_limit, 1);
        assert_eq!(config.run_interval, Duration::from_secs(60));
        assert_eq!(config.interrupt_threshold, Duration::from_secs(300));
        assert_eq!(config.interrupt_interval, Duration::from_secs(60));
        assert_eq!(config.tx_retries, 20);
        assert_eq!(config.send_retries, 3);
    }

    #[test]
    fn overrides_are_parsed_and_mapped_onto_workers() {
        let config = load(&[
            (ENV_SERVER_ID, "srv-7"),
            (ENV_DATABASE_URL, "postgres://localhost/jobs"),
            (ENV_RUN_JOBS_LIMIT, "4"),
            (ENV_RUN_INTERVAL_SECS, "5"),
            (ENV_INTERRUPT_THRESHOLD_SECS, "900"),
            (ENV_INTERRUPT_INTERVAL_SECS, "30"),
            (ENV_TX_RETRIES, "2"),
            (ENV_SEND_RETRIES, " 0 "),
        ])
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/jobs"));
        assert_eq!(config.retryable_transaction().retries(), 2);
        assert_eq!(config.retryable_send().retries(), 0);

        let executor = config.executor_config();
        assert_eq!(executor.server_id.as_str(), "srv-7");
        assert_eq!(executor.run_jobs_limit, 4);
        assert_eq!(executor.poll_interval, Duration::from_secs(5));

        let reaper = config.reaper_config();
        assert_eq!(reaper.threshold, Duration::from_secs(900));
        assert_eq!(reaper.interval, Duration::from_secs(30));
        assert_eq!(reaper.server_id, None);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[(ENV_DATABASE_URL, "  "), (ENV_TX_RETRIES, "")]).unwrap();
        assert_eq!(config.database_url, None);
        assert_eq!(config.tx_retries, STD_TX_RETRIES);
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = load(&[(ENV_TX_RETRIES, "lots")]).unwrap_err();
        let ConfigError::Invalid { var, value, .. } = err;
        assert_eq!(var, ENV_TX_RETRIES);
        assert_eq!(value, "lots");

        assert!(load(&[(ENV_INTERRUPT_THRESHOLD_SECS, "-1")]).is_err());
    }

    #[test]
    fn zero_limit_and_zero_periods_are_rejected() {
        assert!(load(&[(ENV_RUN_JOBS_LIMIT, "0")]).is_err());
        assert!(load(&[(ENV_RUN_INTERVAL_SECS, "0")]).is_err());
        assert!(load(&[(ENV_INTERRUPT_INTERVAL_SECS, "0")]).is_err());
        // A zero threshold reaps every running run on each pass; allowed.
        assert!(load(&[(ENV_INTERRUPT_THRESHOLD_SECS, "0")]).is_ok());
    }
}
