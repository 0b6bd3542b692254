//! Session service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use chrono_tz::Tz;
use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default maximum database pool size.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;

/// Default shutdown drain period in seconds.
pub const DEFAULT_DRAIN_SECONDS: u64 = 5;

/// Fallback display timezone for sessions and members without one.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::UTC;

/// Session service configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Database URL and webhook token are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Server bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Webhook receiving member notifications and session updates.
    /// When unset, notifications are only logged.
    pub notifier_webhook_url: Option<String>,

    /// Bearer token sent to the notifier webhook.
    pub notifier_webhook_token: Option<SecretString>,

    /// Base URL of the external calendar event service.
    /// When unset, external event sync is disabled.
    pub event_sync_url: Option<String>,

    /// Fallback display timezone.
    pub default_timezone: Tz,

    /// Maximum database pool connections.
    pub db_max_connections: u32,

    /// Seconds to keep serving in-flight requests after a shutdown signal.
    pub drain_seconds: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("bind_address", &self.bind_address)
            .field("notifier_webhook_url", &self.notifier_webhook_url)
            .field(
                "notifier_webhook_token",
                &self.notifier_webhook_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("event_sync_url", &self.event_sync_url)
            .field("default_timezone", &self.default_timezone.name())
            .field("db_max_connections", &self.db_max_connections)
            .field("drain_seconds", &self.drain_seconds)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid timezone configuration: {0}")]
    InvalidTimezone(String),

    #[error("Invalid database pool configuration: {0}")]
    InvalidPoolSize(String),

    #[error("Invalid drain period configuration: {0}")]
    InvalidDrainPeriod(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = vars
            .get("DATABASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?
            .clone();

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let notifier_webhook_url = non_empty(vars.get("NOTIFIER_WEBHOOK_URL"));
        let notifier_webhook_token =
            non_empty(vars.get("NOTIFIER_WEBHOOK_TOKEN")).map(SecretString::from);
        let event_sync_url = non_empty(vars.get("EVENT_SYNC_URL"));

        let default_timezone = match vars.get("DEFAULT_TIMEZONE") {
            Some(name) => name.parse::<Tz>().map_err(|e| {
                ConfigError::InvalidTimezone(format!(
                    "DEFAULT_TIMEZONE must be an IANA timezone name, got '{}': {}",
                    name, e
                ))
            })?,
            None => DEFAULT_TIMEZONE,
        };

        let db_max_connections = if let Some(value_str) = vars.get("DB_MAX_CONNECTIONS") {
            let value: u32 = value_str.parse().map_err(|e| {
                ConfigError::InvalidPoolSize(format!(
                    "DB_MAX_CONNECTIONS must be a valid positive integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            if value == 0 {
                return Err(ConfigError::InvalidPoolSize(
                    "DB_MAX_CONNECTIONS must be greater than 0".to_string(),
                ));
            }

            value
        } else {
            DEFAULT_DB_MAX_CONNECTIONS
        };

        let drain_seconds = match vars.get("SS_DRAIN_SECONDS") {
            Some(value_str) => value_str.parse().map_err(|e| {
                ConfigError::InvalidDrainPeriod(format!(
                    "SS_DRAIN_SECONDS must be a valid non-negative integer, got '{}': {}",
                    value_str, e
                ))
            })?,
            None => DEFAULT_DRAIN_SECONDS,
        };

        Ok(Config {
            database_url,
            bind_address,
            notifier_webhook_url,
            notifier_webhook_token,
            event_sync_url,
            default_timezone,
            db_max_connections,
            drain_seconds,
        })
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
