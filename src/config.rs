//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub line: LineConfig,
    pub broadcast: BroadcastConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "inbox.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://inbox.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// LINE Messaging API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LineConfig {
    /// API base URL, overridable for tests against a stub server
    pub api_base_url: String,
    /// Per-call timeout for provider requests in seconds
    pub request_timeout_seconds: u64,
    /// Accept webhook deliveries without an x-line-signature header.
    ///
    /// Intended for local testing only; a missing header is rejected
    /// with 401 when this is false.
    #[serde(default)]
    pub allow_unsigned_webhooks: bool,
}

/// Broadcast orchestration configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    /// Recipients per multicast call (provider ceiling is 500)
    pub batch_size: usize,
    /// Delay between batches in milliseconds
    pub batch_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

/// Provider ceiling for recipients per multicast call.
pub const MULTICAST_RECIPIENT_CEILING: usize = 500;

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (LINEDECK_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost")?
            .set_default("server.protocol", "http")?
            .set_default("line.api_base_url", "https://api.line.me")?
            .set_default("line.request_timeout_seconds", 30)?
            .set_default("line.allow_unsigned_webhooks", false)?
            .set_default("broadcast.batch_size", 500)?
            .set_default("broadcast.batch_delay_ms", 1000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (LINEDECK_*)
            .add_source(
                Environment::with_prefix("LINEDECK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.broadcast.batch_size == 0 {
            return Err(crate::error::AppError::Config(
                "broadcast.batch_size must be greater than 0".to_string(),
            ));
        }

        if self.broadcast.batch_size > MULTICAST_RECIPIENT_CEILING {
            return Err(crate::error::AppError::Config(format!(
                "broadcast.batch_size must not exceed the provider ceiling of {}",
                MULTICAST_RECIPIENT_CEILING
            )));
        }

        if self.line.request_timeout_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "line.request_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.line.allow_unsigned_webhooks {
            tracing::warn!(
                "Webhook signature enforcement is disabled; unsigned deliveries will be accepted"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
impl AppConfig {
    /// Baseline config for unit tests; tweak fields as needed.
    pub(crate) fn default_for_tests() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/linedeck-test.db"),
            },
            line: LineConfig {
                api_base_url: "https://api.line.me".to_string(),
                request_timeout_seconds: 30,
                allow_unsigned_webhooks: false,
            },
            broadcast: BroadcastConfig {
                batch_size: 500,
                batch_delay_ms: 1000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}
