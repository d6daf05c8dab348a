//! Main application configuration
//!
//! This module defines the primary configuration structures for the
//! ephemeral-chat pairing service, including TOML/environment loading and
//! validation.

use crate::types::DisconnectPolicy;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub pairing: PairingSettings,
    pub session: SessionSettings,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Service name for logging and metrics
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Interface the chat API and WebSocket endpoint bind to
    pub http_host: String,
    /// Port for the chat API and WebSocket endpoint
    pub http_port: u16,
    /// Port for health checks and Prometheus metrics
    pub metrics_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,
    /// Externally visible base URL (e.g. `wss://chat.example.com`) used in `websocket_url`
    pub public_base_url: Option<String>,
}

/// Pairing engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingSettings {
    /// Fixed lifetime of a conversation in seconds
    pub round_duration_seconds: u64,
    /// Minimum seconds between two skips from the same participant
    pub skip_cooldown_seconds: u64,
    /// What happens to a conversation when one side disconnects
    pub disconnect_policy: DisconnectPolicy,
    /// Disconnected waiters older than this are dropped from the queue
    pub stale_waiting_seconds: u64,
    /// Interval of the stale waiter cleanup task
    pub cleanup_interval_seconds: u64,
}

/// Session token settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Lifetime of anonymous session tokens in seconds
    pub anonymous_ttl_seconds: u64,
    /// Lifetime of registered session tokens in seconds
    pub registered_ttl_seconds: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "ephemeral-chat".to_string(),
            log_level: "info".to_string(),
            http_host: "0.0.0.0".to_string(),
            http_port: 8080,
            metrics_port: 9090,
            shutdown_timeout_seconds: 30,
            public_base_url: None,
        }
    }
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            round_duration_seconds: 180,  // 3 minutes
            skip_cooldown_seconds: 10,
            disconnect_policy: DisconnectPolicy::KeepUntilRoundEnds,
            stale_waiting_seconds: 600,   // 10 minutes
            cleanup_interval_seconds: 60, // 1 minute
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            anonymous_ttl_seconds: 300,    // 5 minutes
            registered_ttl_seconds: 86400, // 24 hours
        }
    }
}

impl PairingSettings {
    /// Get round duration as Duration
    pub fn round_duration(&self) -> Duration {
        Duration::from_secs(self.round_duration_seconds)
    }

    /// Get skip cooldown as Duration
    pub fn skip_cooldown(&self) -> Duration {
        Duration::from_secs(self.skip_cooldown_seconds)
    }

    /// Get stale waiter threshold as Duration
    pub fn stale_waiting(&self) -> Duration {
        Duration::from_secs(self.stale_waiting_seconds)
    }

    /// Get cleanup interval as Duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

impl SessionSettings {
    pub fn anonymous_ttl(&self) -> Duration {
        Duration::from_secs(self.anonymous_ttl_seconds)
    }

    pub fn registered_ttl(&self) -> Duration {
        Duration::from_secs(self.registered_ttl_seconds)
    }
}

/// Parse an environment variable if it is set
fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("Invalid {} value: {}", name, raw)),
        Err(_) => Ok(None),
    }
}

impl AppConfig {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env_overrides()?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply environment variable overrides on top of the current values
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        // Service settings
        if let Ok(name) = env::var("SERVICE_NAME") {
            self.service.name = name;
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            self.service.log_level = log_level;
        }
        if let Ok(host) = env::var("HTTP_HOST") {
            self.service.http_host = host;
        }
        if let Some(port) = env_parse("HTTP_PORT")? {
            self.service.http_port = port;
        }
        if let Some(port) = env_parse("METRICS_PORT")? {
            self.service.metrics_port = port;
        }
        if let Some(timeout) = env_parse("SHUTDOWN_TIMEOUT_SECONDS")? {
            self.service.shutdown_timeout_seconds = timeout;
        }
        if let Ok(url) = env::var("PUBLIC_BASE_URL") {
            self.service.public_base_url = Some(url);
        }

        // Pairing settings
        if let Some(seconds) = env_parse("ROUND_DURATION_SECONDS")? {
            self.pairing.round_duration_seconds = seconds;
        }
        if let Some(seconds) = env_parse("SKIP_COOLDOWN_SECONDS")? {
            self.pairing.skip_cooldown_seconds = seconds;
        }
        if let Ok(policy) = env::var("DISCONNECT_POLICY") {
            self.pairing.disconnect_policy = policy
                .parse()
                .map_err(|e| anyhow!("Invalid DISCONNECT_POLICY value: {}", e))?;
        }
        if let Some(seconds) = env_parse("STALE_WAITING_SECONDS")? {
            self.pairing.stale_waiting_seconds = seconds;
        }
        if let Some(seconds) = env_parse("CLEANUP_INTERVAL_SECONDS")? {
            self.pairing.cleanup_interval_seconds = seconds;
        }

        // Session settings
        if let Some(seconds) = env_parse("ANONYMOUS_TTL_SECONDS")? {
            self.session.anonymous_ttl_seconds = seconds;
        }
        if let Some(seconds) = env_parse("REGISTERED_TTL_SECONDS")? {
            self.session.registered_ttl_seconds = seconds;
        }

        Ok(())
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_timeout_seconds)
    }

    /// Get cleanup interval as Duration
    pub fn cleanup_interval(&self) -> Duration {
        self.pairing.cleanup_interval()
    }

    /// Address the chat API binds to
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.service.http_host, self.service.http_port)
    }
}

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    // Validate log level
    match config.service.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow!("Invalid log level: {}", config.service.log_level)),
    }

    // Validate ports
    if config.service.http_port == 0 {
        return Err(anyhow!("HTTP port cannot be 0"));
    }
    if config.service.metrics_port == 0 {
        return Err(anyhow!("Metrics port cannot be 0"));
    }
    if config.service.http_port == config.service.metrics_port {
        return Err(anyhow!(
            "HTTP and metrics ports must differ (both {})",
            config.service.http_port
        ));
    }

    // Validate timeouts
    if config.service.shutdown_timeout_seconds == 0 {
        return Err(anyhow!("Shutdown timeout must be greater than 0"));
    }

    if let Some(url) = &config.service.public_base_url {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(anyhow!("Public base URL must use ws:// or wss://: {}", url));
        }
    }

    // Validate pairing settings
    if config.pairing.round_duration_seconds == 0 {
        return Err(anyhow!("Round duration must be greater than 0"));
    }
    if config.pairing.stale_waiting_seconds == 0 {
        return Err(anyhow!("Stale waiting threshold must be greater than 0"));
    }
    if config.pairing.cleanup_interval_seconds == 0 {
        return Err(anyhow!("Cleanup interval must be greater than 0"));
    }

    // Validate session settings
    if config.session.anonymous_ttl_seconds == 0 || config.session.registered_ttl_seconds == 0 {
        return Err(anyhow!("Session TTLs must be greater than 0"));
    }

    Ok(())
}
