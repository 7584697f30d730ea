use crate::protocol::BlobMode;
use std::env;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 7624;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

/// Connection and session settings for an INDI client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// BLOB policy requested automatically for devices that define BLOB vectors
    pub blob_mode: BlobMode,
    /// Maximum number of undrained events kept for polling callers
    pub event_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            blob_mode: BlobMode::Also,
            event_queue_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    /// Load configuration from `INDI_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| env::var(key).ok())?;
        log::debug!(
            "Loaded INDI configuration for {} (blob mode {})",
            config.address(),
            config.blob_mode
        );
        Ok(config)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("INDI_HOST") {
            if host.trim().is_empty() {
                return Err(invalid("INDI_HOST", "host cannot be empty"));
            }
            config.host = host.trim().to_string();
        }

        if let Some(port) = lookup("INDI_PORT") {
            config.port = port
                .trim()
                .parse()
                .map_err(|e| invalid("INDI_PORT", format!("{}", e)))?;
        }

        if let Some(ms) = lookup("INDI_CONNECT_TIMEOUT_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|e| invalid("INDI_CONNECT_TIMEOUT_MS", format!("{}", e)))?;
            if ms == 0 {
                return Err(invalid("INDI_CONNECT_TIMEOUT_MS", "timeout must be positive"));
            }
            config.connect_timeout = Duration::from_millis(ms);
        }

        if let Some(mode) = lookup("INDI_BLOB_MODE") {
            config.blob_mode = mode
                .trim()
                .parse()
                .map_err(|_| invalid("INDI_BLOB_MODE", "expected Never, Also or Only"))?;
        }

        Ok(config)
    }

    /// `host:port` form used for logging and socket resolution
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn invalid(var: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        reason: reason.into(),
    }
}
