//! # Configuration Module
//!
//! Gateway settings read from a TOML file. Every section and field has a default,
//! so a partial file (or an empty one) is valid.
//!
//! ## Configuration Structure
//!
//! - [`ServerConfig`] - where Bases connect, framing limits
//! - [`StorageConfig`] - history database and console retention
//! - [`TransactionConfig`] - pending transaction behaviour
//! - [`DiscoveryConfig`] - node/service discovery pacing
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sensorino::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("sensorino.toml").await?;
//!     let config = Config::load("sensorino.toml").await?;
//!     println!("Bases connect to {}", config.server.base_listen);
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::discovery::DiscoveryOptions;
use crate::protocol::framer::DEFAULT_MAX_OBJECT;
use crate::state::TrackerOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transactions: TransactionConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address Bases connect to.
    #[serde(default = "default_base_listen")]
    pub base_listen: String,
    /// Largest object accepted from a Base before the framer resynchronises.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_base_listen() -> String {
    "127.0.0.1:8001".to_string()
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_OBJECT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_listen: default_base_listen(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Console lines kept in memory.
    #[serde(default = "default_console_lines")]
    pub console_lines: usize,
    /// Console lines returned by a point-in-time console query.
    #[serde(default = "default_console_history")]
    pub console_history: usize,
    /// Upper bound on rows returned by range queries.
    #[serde(default = "default_range_limit")]
    pub range_limit: usize,
}

fn default_db_path() -> String {
    "./data/sensorino.db".to_string()
}

fn default_console_lines() -> usize {
    30
}

fn default_console_history() -> usize {
    64
}

fn default_range_limit() -> usize {
    1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            console_lines: default_console_lines(),
            console_history: default_console_history(),
            range_limit: default_range_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Seconds without a reply before a transaction is assumed successful.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Treat a garbled reply as an error reply for the node it most likely came from.
    #[serde(default = "default_true")]
    pub invalid_reply_is_failure: bool,
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_true() -> bool {
    true
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            invalid_reply_is_failure: true,
        }
    }
}

impl TransactionConfig {
    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            transaction_timeout: Duration::from_secs(self.timeout_secs),
            invalid_reply_is_failure: self.invalid_reply_is_failure,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_min_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    5000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl DiscoveryConfig {
    pub fn options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            enabled: self.enabled,
            min_delay: Duration::from_millis(self.min_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: Some("sensorino.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}
