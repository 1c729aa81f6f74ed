//! Boundary configuration: the three environment variables a caller uses to
//! point at a database, separate sessions, and set log verbosity.

use std::env;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level '{0}'")]
    InvalidLogLevel(String),
}

const DEFAULT_DB: &str = "stix.db";
const DEFAULT_SESSION: &str = "test-id";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Resolved connection/session/logging configuration for a store handle.
#[derive(Debug, Clone)]
pub struct Config {
    pub db: String,
    pub session: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db: default_db(),
            session: default_session(),
            log_level: default_log_level(),
        }
    }
}

pub fn default_db() -> String {
    env::var("FIREPITDB").unwrap_or_else(|_| DEFAULT_DB.to_string())
}

pub fn default_session() -> String {
    env::var("FIREPITID").unwrap_or_else(|_| DEFAULT_SESSION.to_string())
}

pub fn default_log_level() -> String {
    env::var("LOGLEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
}

impl Config {
    /// Read `FIREPITDB`/`FIREPITID`/`LOGLEVEL` from the environment, falling
    /// back to the same defaults the CLI uses when unset.
    pub fn from_env() -> Self {
        Self {
            db: default_db(),
            session: default_session(),
            log_level: default_log_level(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.log_level.to_ascii_lowercase();
        const VALID: &[&str] = &["trace", "debug", "info", "warn", "error"];
        if !VALID.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        Ok(())
    }

    /// Initialize the global `tracing` subscriber from `self.log_level`.
    /// Safe to call more than once; later calls are no-ops.
    pub fn init_tracing(&self) {
        let filter = tracing_subscriber::EnvFilter::try_new(&self.log_level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_LEVEL));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}
