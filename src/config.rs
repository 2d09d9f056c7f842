//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::chain::RpcConfig;
use crate::session::SessionConfig;
use crate::types::Address;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub contracts: ContractsConfig,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// JSON-RPC node settings
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_rpc_url() -> String {
    "http://localhost:8545".to_string()
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_poll_interval() -> u64 {
    2_000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            request_timeout_ms: default_request_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Deployed contract addresses
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractsConfig {
    /// Fund-manager contract; required
    pub fund_manager: Option<String>,

    /// Deposit token (USDT); deposits are unavailable without it
    pub token: Option<String>,
}

/// Session timing and alert settings
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Absolute daily change, in percent, that raises a performance alert
    #[serde(default = "default_alert_threshold")]
    pub performance_alert_threshold: f64,

    #[serde(default = "default_history_days")]
    pub history_days: u32,
}

fn default_call_timeout() -> u64 {
    30
}

fn default_confirmation_timeout() -> u64 {
    300
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_alert_threshold() -> f64 {
    5.0
}

fn default_history_days() -> u32 {
    30
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
            confirmation_timeout_secs: default_confirmation_timeout(),
            refresh_interval_secs: default_refresh_interval(),
            performance_alert_threshold: default_alert_threshold(),
            history_days: default_history_days(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("fundboard").join("config.toml")),
            Some(PathBuf::from("./fundboard.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("FUNDBOARD_RPC_URL") {
            self.network.rpc_url = url;
        }

        if let Some(address) = lookup("FUNDBOARD_FUND_MANAGER_ADDRESS") {
            self.contracts.fund_manager = Some(address);
        }
        if let Some(address) = lookup("FUNDBOARD_TOKEN_ADDRESS") {
            self.contracts.token = Some(address);
        }

        if let Some(level) = lookup("FUNDBOARD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("FUNDBOARD_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Check the settings a session cannot start without
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fund_manager_address()?;
        self.token_address()?;
        Ok(())
    }

    pub fn fund_manager_address(&self) -> Result<Address, ConfigError> {
        match self.contracts.fund_manager.as_deref().map(str::trim) {
            None | Some("") => Err(ConfigError::MissingFundManagerAddress),
            Some(raw) => parse_address("contracts.fund_manager", raw),
        }
    }

    pub fn token_address(&self) -> Result<Option<Address>, ConfigError> {
        match self.contracts.token.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => parse_address("contracts.token", raw).map(Some),
        }
    }

    /// Session settings with addresses resolved
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let mut config = SessionConfig::new(self.fund_manager_address()?);
        config.token = self.token_address()?;
        config.call_timeout = Duration::from_secs(self.session.call_timeout_secs);
        config.confirmation_timeout = Duration::from_secs(self.session.confirmation_timeout_secs);
        config.refresh_interval = Duration::from_secs(self.session.refresh_interval_secs);
        config.performance_alert_threshold = self.session.performance_alert_threshold;
        config.history_days = self.session.history_days;
        Ok(config)
    }

    pub fn rpc_config(&self) -> RpcConfig {
        RpcConfig {
            url: self.network.rpc_url.clone(),
            request_timeout_ms: self.network.request_timeout_ms,
            poll_interval_ms: self.network.poll_interval_ms,
        }
    }
}

fn parse_address(field: &'static str, raw: &str) -> Result<Address, ConfigError> {
    Address::parse(raw).map_err(|e| ConfigError::InvalidAddress {
        field,
        error: e.to_string(),
    })
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error(
        "Fund manager address is not configured; \
         set contracts.fund_manager or FUNDBOARD_FUND_MANAGER_ADDRESS"
    )]
    MissingFundManagerAddress,

    #[error("Invalid address in {field}: {error}")]
    InvalidAddress { field: &'static str, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Fundboard Configuration
#
# Environment variables override these settings:
# - FUNDBOARD_RPC_URL
# - FUNDBOARD_FUND_MANAGER_ADDRESS
# - FUNDBOARD_TOKEN_ADDRESS
# - FUNDBOARD_LOG_LEVEL
# - FUNDBOARD_LOG_FORMAT

[network]
# JSON-RPC endpoint of the node or wallet bridge
rpc_url = "http://localhost:8545"

# HTTP timeout per request (ms)
request_timeout_ms = 10000

# How often to poll for receipts, logs and account changes (ms)
poll_interval_ms = 2000

[contracts]
# Fund manager contract address (required)
fund_manager = ""

# Deposit token (USDT) address
# token = "0x..."

[session]
# Bound on every contract read and transaction submission (seconds)
call_timeout_secs = 30

# Bound on waiting for a transaction to be mined (seconds)
confirmation_timeout_secs = 300

# Background refresh interval (seconds)
refresh_interval_secs = 30

# Daily fund change, in percent, that raises a performance alert
performance_alert_threshold = 5.0

# Default window for historical performance
history_days = 30

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
