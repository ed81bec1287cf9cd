//! Configuration module
//!
//! All settings come from the environment (optionally via `.env`). The
//! anonymization salt is deliberately mandatory: starting without one would
//! either break cross-scan hash stability or silently hash with an empty
//! salt, so a missing salt refuses startup instead.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ANONYMIZATION_SALT must be set and non-empty")]
    MissingSalt,

    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Server port
    pub port: u16,

    /// Salt for identifier anonymization. Changing it invalidates
    /// cross-referencing of previously written hashes (documented risk).
    pub anonymization_salt: String,

    /// Directory where exported dataset files are written
    pub export_dir: PathBuf,

    /// Interval between background aggregation passes, in seconds
    pub aggregation_interval_secs: u64,

    /// Bounded wait for the per-(account, month) aggregation lock
    pub aggregation_lock_wait_ms: u64,

    /// Environment (development, production)
    pub environment: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let anonymization_salt = env::var("ANONYMIZATION_SALT")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingSalt)?;

        Ok(Self {
            database_path: env::var("IDLEWATCH_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("idlewatch.db")),

            port: match env::var("PORT") {
                Ok(p) => p.parse().map_err(|_| ConfigError::InvalidValue("PORT"))?,
                Err(_) => 8080,
            },

            anonymization_salt,

            export_dir: env::var("EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("exports")),

            aggregation_interval_secs: match env::var("AGGREGATION_INTERVAL_SECS") {
                Ok(v) => v
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("AGGREGATION_INTERVAL_SECS"))?,
                Err(_) => 3600,
            },

            aggregation_lock_wait_ms: match env::var("AGGREGATION_LOCK_WAIT_MS") {
                Ok(v) => v
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("AGGREGATION_LOCK_WAIT_MS"))?,
                Err(_) => 5000,
            },

            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_salt_is_fatal() {
        // from_env reads the process environment; simulate via a scoped var.
        std::env::remove_var("ANONYMIZATION_SALT");
        assert!(matches!(Config::from_env(), Err(ConfigError::MissingSalt)));

        std::env::set_var("ANONYMIZATION_SALT", "   ");
        assert!(matches!(Config::from_env(), Err(ConfigError::MissingSalt)));

        std::env::set_var("ANONYMIZATION_SALT", "unit-test-salt");
        let config = Config::from_env().expect("salt present");
        assert_eq!(config.anonymization_salt, "unit-test-salt");
        assert!(!config.is_production());

        std::env::set_var("ENVIRONMENT", "production");
        let config = Config::from_env().expect("salt present");
        assert!(config.is_production());
        std::env::remove_var("ENVIRONMENT");
        std::env::remove_var("ANONYMIZATION_SALT");
    }
}
