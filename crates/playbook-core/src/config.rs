// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

/// Playbook engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// HTTP server port for the run query/control surface
    pub http_port: u16,
    /// Idempotency record time-to-live in hours
    pub idempotency_ttl_hours: i64,
    /// Default cap on step executions returned by run detail queries
    pub step_limit: i64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `PLAYBOOK_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `PLAYBOOK_HTTP_PORT`: HTTP server port (default: 8080)
    /// - `PLAYBOOK_IDEMPOTENCY_TTL_HOURS`: idempotency record TTL (default: 24)
    /// - `PLAYBOOK_STEP_LIMIT`: default step execution page size (default: 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("PLAYBOOK_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("PLAYBOOK_DATABASE_URL"))?;

        let http_port: u16 = std::env::var("PLAYBOOK_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("PLAYBOOK_HTTP_PORT", "must be a valid port number")
            })?;

        let idempotency_ttl_hours: i64 = std::env::var("PLAYBOOK_IDEMPOTENCY_TTL_HOURS")
            .unwrap_or_else(|_| "24".to_string())
            .parse()
            .ok()
            .filter(|v| *v > 0)
            .ok_or(ConfigError::Invalid(
                "PLAYBOOK_IDEMPOTENCY_TTL_HOURS",
                "must be a positive integer",
            ))?;

        let step_limit: i64 = std::env::var("PLAYBOOK_STEP_LIMIT")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .ok()
            .filter(|v| *v > 0)
            .ok_or(ConfigError::Invalid(
                "PLAYBOOK_STEP_LIMIT",
                "must be a positive integer",
            ))?;

        Ok(Self {
            database_url,
            http_port,
            idempotency_ttl_hours,
            step_limit,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("PLAYBOOK_DATABASE_URL", "postgres://localhost/test");
        guard.remove("PLAYBOOK_HTTP_PORT");
        guard.remove("PLAYBOOK_IDEMPOTENCY_TTL_HOURS");
        guard.remove("PLAYBOOK_STEP_LIMIT");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.idempotency_ttl_hours, 24);
        assert_eq!(config.step_limit, 100);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("PLAYBOOK_DATABASE_URL", "postgres://user:pass@db:5432/prod");
        guard.set("PLAYBOOK_HTTP_PORT", "9090");
        guard.set("PLAYBOOK_IDEMPOTENCY_TTL_HOURS", "48");
        guard.set("PLAYBOOK_STEP_LIMIT", "250");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://user:pass@db:5432/prod");
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.idempotency_ttl_hours, 48);
        assert_eq!(config.step_limit, 250);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("PLAYBOOK_DATABASE_URL");

        let result = Config::from_env();
        assert!(result.is_err());

        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::Missing("PLAYBOOK_DATABASE_URL")));
        assert!(err.to_string().contains("PLAYBOOK_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("PLAYBOOK_DATABASE_URL", "postgres://localhost/test");
        guard.set("PLAYBOOK_HTTP_PORT", "not_a_number");

        let result = Config::from_env();
        assert!(result.is_err());

        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("PLAYBOOK_HTTP_PORT", _)));
    }

    #[test]
    fn test_config_rejects_non_positive_ttl() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("PLAYBOOK_DATABASE_URL", "postgres://localhost/test");
        guard.set("PLAYBOOK_IDEMPOTENCY_TTL_HOURS", "0");

        let result = Config::from_env();
        assert!(result.is_err());

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("PLAYBOOK_IDEMPOTENCY_TTL_HOURS", _)
        ));
    }

    #[test]
    fn test_config_rejects_negative_step_limit() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("PLAYBOOK_DATABASE_URL", "postgres://localhost/test");
        guard.set("PLAYBOOK_STEP_LIMIT", "-5");

        let result = Config::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
