//! # Process configuration
//!
//! Everything is read once at startup, from the process environment after
//! loading an optional `.env` file. The relay settings may be incomplete
//! here: a missing value is reported on every delivery attempt instead of
//! preventing the HTTP service from starting.

use std::env;
use std::time::Duration;

use axum::http::HeaderValue;
use thiserror::Error;
use tracing::{info, warn};

use crate::dispatch::{DeliveryError, FailureStage};

pub const DEFAULT_API_PORT: u16 = 8080;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HELO_NAME: &str = "localhost";
pub const DEFAULT_CORS_ORIGIN: &str = "https://ezequielunia.com.ar";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Upstream relay settings, exactly as found in the environment.
#[derive(Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub helo_name: String,
}

/// A [`RelayConfig`] that passed the pre-flight check.
#[derive(Clone)]
pub struct Relay {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub helo_name: String,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("helo_name", &self.helo_name)
            .finish()
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("helo_name", &self.helo_name)
            .finish()
    }
}

impl RelayConfig {
    pub fn new(
        host: impl Into<String>,
        port: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        RelayConfig {
            host: host.into(),
            port: port.into(),
            username: username.into(),
            password: password.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            helo_name: DEFAULT_HELO_NAME.to_owned(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let timeout = match env::var("SMTP_TIMEOUT_SECS") {
            Ok(value) => value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .ok_or(ConfigError::InvalidValue {
                    key: "SMTP_TIMEOUT_SECS",
                    value,
                })?,
            Err(_) => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        Ok(RelayConfig {
            host: var_or_empty("SMTP_HOST"),
            port: var_or_empty("SMTP_PORT"),
            username: var_or_empty("SMTP_USER"),
            password: var_or_empty("SMTP_PASS"),
            timeout,
            helo_name: env::var("SMTP_HELO_NAME")
                .ok()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_HELO_NAME.to_owned()),
        })
    }

    /// Names of the required settings that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("SMTP_HOST", &self.host),
            ("SMTP_PORT", &self.port),
            ("SMTP_USER", &self.username),
            ("SMTP_PASS", &self.password),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(key, _)| key)
        .collect()
    }

    /// Pre-flight check run before any network activity.
    ///
    /// ```
    /// # use mail_relay::config::RelayConfig;
    /// # use mail_relay::dispatch::FailureStage;
    /// let config = RelayConfig::new("smtp.example.com", "", "me@example.com", "hunter2");
    /// let err = config.validate().unwrap_err();
    /// assert_eq!(err.stage, FailureStage::Configuration);
    /// ```
    pub fn validate(&self) -> Result<Relay, DeliveryError> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(DeliveryError::new(
                FailureStage::Configuration,
                format!("missing {}", missing.join(", ")),
            ));
        }

        let port = self.port.trim().parse::<u16>().map_err(|_| {
            DeliveryError::new(
                FailureStage::Configuration,
                format!("invalid port {:?}", self.port),
            )
        })?;

        Ok(Relay {
            host: self.host.trim().to_owned(),
            port,
            username: self.username.trim().to_owned(),
            password: self.password.clone(),
            timeout: self.timeout,
            helo_name: self.helo_name.clone(),
        })
    }
}

fn var_or_empty(key: &str) -> String {
    env::var(key).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_port: u16,
    pub cors_origin: HeaderValue,
    pub relay: RelayConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let api_port = match env::var("API_PORT") {
            Ok(value) if !value.trim().is_empty() => {
                value.trim().parse::<u16>().map_err(|_| {
                    ConfigError::InvalidValue {
                        key: "API_PORT",
                        value: value.clone(),
                    }
                })?
            }
            _ => DEFAULT_API_PORT,
        };

        let origin = env::var("CORS_ALLOW_ORIGIN")
            .unwrap_or_else(|_| DEFAULT_CORS_ORIGIN.to_owned());
        let cors_origin = HeaderValue::from_str(origin.trim()).map_err(|_| {
            ConfigError::InvalidValue {
                key: "CORS_ALLOW_ORIGIN",
                value: origin.clone(),
            }
        })?;

        Ok(AppConfig {
            api_port,
            cors_origin,
            relay: RelayConfig::from_env()?,
        })
    }

    /// Startup summary. The password is never logged.
    pub fn log_summary(&self) {
        info!(
            smtp_host = %self.relay.host,
            smtp_port = %self.relay.port,
            smtp_user = %self.relay.username,
            timeout_secs = self.relay.timeout.as_secs(),
            "relay configuration loaded"
        );

        let missing = self.relay.missing_fields();
        if !missing.is_empty() {
            warn!(
                missing = %missing.join(", "),
                "relay configuration incomplete, deliveries will fail"
            );
        }
    }
}
