//! Keyshare Configuration
//!
//! Shared configuration crate for the keyshare module and its node driver.
//!
//! Handles loading configuration from:
//! 1. KS_CONFIG env var (explicit path)
//! 2. ./config.toml (current directory)
//! 3. ~/.keyshare/config.toml (user home)
//!
//! Environment variables take precedence over TOML config. There is no global
//! instance: callers load a [`KeyshareConfig`] once and hand the relevant
//! sections to the core explicitly.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{env, fs};

const CONFIG_FILE_NAME: &str = "config.toml";
const CONFIG_DIR_NAME: &str = ".keyshare";

// ============================================================================
// Default Constants
// ============================================================================

const DEFAULT_KEY_EXPIRY: u64 = 100;
const DEFAULT_THRESHOLD_NUMERATOR: u64 = 2;
const DEFAULT_THRESHOLD_DENOMINATOR: u64 = 3;
const DEFAULT_PORT_ID: &str = "keyshare";
const DEFAULT_VERSION: &str = "pep-1";
const DEFAULT_KEYSHARE_VERSION: &str = "keyshare-1";
const DEFAULT_DB_PATH: &str = "./keyshare-db";
const DEFAULT_BLOCK_INTERVAL_MS: u64 = 1000;

// ============================================================================
// Config Structs
// ============================================================================

/// Root configuration structure (matches TOML layout)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyshareConfig {
    #[serde(default)]
    pub params: ParamsConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub node: NodeConfig,
}

/// Module parameters (governance-controlled on a live chain)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParamsConfig {
    /// Blocks each public key stays active for
    #[serde(default = "default_key_expiry")]
    pub key_expiry: u64,
    /// Addresses allowed to queue a new public key
    #[serde(default)]
    pub trusted_addresses: Vec<String>,
    #[serde(default = "default_threshold_numerator")]
    pub threshold_numerator: u64,
    #[serde(default = "default_threshold_denominator")]
    pub threshold_denominator: u64,
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            key_expiry: DEFAULT_KEY_EXPIRY,
            trusted_addresses: Vec::new(),
            threshold_numerator: DEFAULT_THRESHOLD_NUMERATOR,
            threshold_denominator: DEFAULT_THRESHOLD_DENOMINATOR,
        }
    }
}

fn default_key_expiry() -> u64 {
    DEFAULT_KEY_EXPIRY
}
fn default_threshold_numerator() -> u64 {
    DEFAULT_THRESHOLD_NUMERATOR
}
fn default_threshold_denominator() -> u64 {
    DEFAULT_THRESHOLD_DENOMINATOR
}

/// Cross-chain channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Port the module binds to
    #[serde(default = "default_port_id")]
    pub port_id: String,
    /// Base channel version
    #[serde(default = "default_version")]
    pub version: String,
    /// Keyshare-specific channel version
    #[serde(default = "default_keyshare_version")]
    pub keyshare_version: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            port_id: DEFAULT_PORT_ID.into(),
            version: DEFAULT_VERSION.into(),
            keyshare_version: DEFAULT_KEYSHARE_VERSION.into(),
        }
    }
}

fn default_port_id() -> String {
    DEFAULT_PORT_ID.into()
}
fn default_version() -> String {
    DEFAULT_VERSION.into()
}
fn default_keyshare_version() -> String {
    DEFAULT_KEYSHARE_VERSION.into()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_DB_PATH.into(),
        }
    }
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.into()
}

/// Node driver configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    /// Milliseconds between simulated blocks
    #[serde(default = "default_block_interval")]
    pub block_interval_ms: u64,
    /// Optional genesis file (JSON)
    #[serde(default)]
    pub genesis_path: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            block_interval_ms: DEFAULT_BLOCK_INTERVAL_MS,
            genesis_path: None,
        }
    }
}

fn default_block_interval() -> u64 {
    DEFAULT_BLOCK_INTERVAL_MS
}

// ============================================================================
// Environment Variable Helpers
// ============================================================================

/// Set field from env var if present
fn env_string(key: &str, field: &mut String) {
    if let Ok(v) = env::var(key) {
        *field = v;
    }
}

/// Set Option<String> from env var if present
fn env_option_string(key: &str, field: &mut Option<String>) {
    if let Ok(v) = env::var(key) {
        *field = Some(v);
    }
}

/// Set field from env var if present and parseable
fn env_parse<T: std::str::FromStr>(key: &str, field: &mut T) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        }
    }
}

/// Set a list from a comma-separated env var if present
fn env_list(key: &str, field: &mut Vec<String>) {
    if let Ok(v) = env::var(key) {
        *field = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
}

// ============================================================================
// Implementation
// ============================================================================

impl KeyshareConfig {
    /// Load configuration from config file with env var overrides
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                log::info!("Loading config from: {}", path.display());
                Self::parse_file(&path)?
            }
            None => {
                log::info!("No config file found, using defaults and environment variables");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::parse_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without touching the environment
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Find the config file path
    fn find_config_file() -> Option<PathBuf> {
        // 1. Check KS_CONFIG env var
        if let Ok(path) = env::var("KS_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // 2. Check ./config.toml (current directory)
        let local_path = PathBuf::from(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Some(local_path);
        }

        // 3. Check ~/.keyshare/config.toml
        dirs::home_dir()
            .map(|h| h.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
            .filter(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Params
        env_parse("KS_KEY_EXPIRY", &mut self.params.key_expiry);
        env_list("KS_TRUSTED_ADDRESSES", &mut self.params.trusted_addresses);

        // Channel
        env_string("KS_PORT_ID", &mut self.channel.port_id);

        // Database
        env_string("KS_DB_PATH", &mut self.database.path);

        // Node
        env_parse("KS_BLOCK_INTERVAL_MS", &mut self.node.block_interval_ms);
        env_option_string("KS_GENESIS", &mut self.node.genesis_path);
    }

    /// Reject configurations the module cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.params.key_expiry == 0 {
            bail!("params.key_expiry must be greater than zero");
        }
        if self.params.threshold_denominator == 0
            || self.params.threshold_numerator == 0
            || self.params.threshold_numerator > self.params.threshold_denominator
        {
            bail!(
                "invalid threshold ratio {}/{}",
                self.params.threshold_numerator,
                self.params.threshold_denominator
            );
        }
        if self.channel.version == self.channel.keyshare_version {
            bail!("channel.version and channel.keyshare_version must differ");
        }
        Ok(())
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Generate a sample config file
    pub fn generate_sample() -> String {
        let mut sample = Self::default();
        sample.params.trusted_addresses = vec!["keyshare1trusted".into()];
        toml::to_string_pretty(&sample).unwrap_or_default()
    }
}
