//! # Configuration Management
//!
//! Centralized configuration for the binding layer.
//!
//! This module provides structured configuration for engine bootstrap, host
//! defaults, event servicing and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (prefix `ENET_BRIDGE_`)
//!
//! Configuration only shapes the binding layer itself. Values that belong to
//! the engine's own validation domain (for example a peer limit of zero) are
//! reported by `validate()` but never rejected by the host API.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Library name handed to the system loader before falling back to bundled artifacts
pub const DEFAULT_LIBRARY_NAME: &str = "enet-jni";

/// Largest peer count the engine's protocol can address
pub const MAX_PEER_LIMIT: usize = 0xFFF;

/// Largest channel count the engine's protocol can address
pub const MAX_CHANNEL_LIMIT: usize = 255;

/// Upper bound applied to every service call
pub const DEFAULT_MAX_SERVICE_TIMEOUT: Duration = Duration::from_secs(60);

/// Time an unanswered connection attempt lingers before it is reported as disconnected
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Main bridge configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BridgeConfig {
    /// Engine bootstrap configuration
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Defaults for host creation
    #[serde(default)]
    pub host: HostConfig,

    /// Event servicing configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| BridgeError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| BridgeError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| BridgeError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("ENET_BRIDGE_LIBRARY_NAME") {
            config.loader.library_name = name;
        }

        if let Ok(dir) = std::env::var("ENET_BRIDGE_NATIVES_DIR") {
            config.loader.natives_dir = Some(PathBuf::from(dir));
        }

        if let Ok(dir) = std::env::var("ENET_BRIDGE_TEMP_DIR") {
            config.loader.temp_dir = Some(PathBuf::from(dir));
        }

        if let Ok(flag) = std::env::var("ENET_BRIDGE_ALLOW_FALLBACK") {
            if let Ok(val) = flag.parse::<bool>() {
                config.loader.allow_fallback = val;
            }
        }

        if let Ok(limit) = std::env::var("ENET_BRIDGE_PEER_LIMIT") {
            if let Ok(val) = limit.parse::<usize>() {
                config.host.peer_limit = val;
            }
        }

        if let Ok(timeout) = std::env::var("ENET_BRIDGE_MAX_SERVICE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.service.max_timeout = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BridgeError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| BridgeError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.loader.validate());
        errors.extend(self.host.validate());
        errors.extend(self.service.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Engine bootstrap configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoaderConfig {
    /// Name passed to the system library search (without prefix or extension)
    pub library_name: String,

    /// Directory containing the `natives/<platform>/<file>` artifact tree
    #[serde(default)]
    pub natives_dir: Option<PathBuf>,

    /// Where extracted artifacts are written (system temp dir when unset)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Whether to extract a bundled artifact when the system load fails
    pub allow_fallback: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            library_name: String::from(DEFAULT_LIBRARY_NAME),
            natives_dir: None,
            temp_dir: None,
            allow_fallback: true,
        }
    }
}

impl LoaderConfig {
    /// Validate loader configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.library_name.is_empty() {
            errors.push("Library name cannot be empty".to_string());
        } else if self.library_name.contains(['/', '\\']) {
            errors.push(format!(
                "Library name must not contain path separators: '{}'",
                self.library_name
            ));
        }

        if let Some(ref dir) = self.natives_dir {
            if !dir.is_dir() {
                errors.push(format!("Natives directory does not exist: {}", dir.display()));
            }
        }

        if let Some(ref dir) = self.temp_dir {
            if !dir.is_dir() {
                errors.push(format!("Temp directory does not exist: {}", dir.display()));
            }
        }

        errors
    }
}

/// Defaults used when creating hosts from configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Address to listen on; unset means an outbound-only client host
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Maximum number of peers allocated for the host
    pub peer_limit: usize,

    /// Maximum number of channels per peer
    pub channel_limit: usize,

    /// Downstream bandwidth in bytes/second; 0 for unlimited
    pub incoming_bandwidth: u32,

    /// Upstream bandwidth in bytes/second; 0 for unlimited
    pub outgoing_bandwidth: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            peer_limit: 32,
            channel_limit: 2,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
        }
    }
}

impl HostConfig {
    /// Validate host configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(ref addr) = self.bind_address {
            if addr.parse::<crate::core::address::Address>().is_err() {
                errors.push(format!(
                    "Invalid bind address format: '{addr}' (expected format: '0.0.0.0:7777')"
                ));
            }
        }

        if self.peer_limit == 0 {
            errors.push("Peer limit must be greater than 0".to_string());
        } else if self.peer_limit > MAX_PEER_LIMIT {
            errors.push(format!(
                "Peer limit too large: {} (maximum: {MAX_PEER_LIMIT})",
                self.peer_limit
            ));
        }

        if self.channel_limit == 0 {
            errors.push("Channel limit must be greater than 0".to_string());
        } else if self.channel_limit > MAX_CHANNEL_LIMIT {
            errors.push(format!(
                "Channel limit too large: {} (maximum: {MAX_CHANNEL_LIMIT})",
                self.channel_limit
            ));
        }

        errors
    }
}

/// Event servicing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Longest time a single service call may block
    #[serde(with = "duration_serde")]
    pub max_timeout: Duration,

    /// How long the loopback engine waits for an answer to a connection attempt
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_timeout: DEFAULT_MAX_SERVICE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ServiceConfig {
    /// Validate service configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_timeout.is_zero() {
            errors.push("Max service timeout must be greater than 0".to_string());
        } else if self.max_timeout.as_millis() > u128::from(u32::MAX) {
            errors.push("Max service timeout does not fit in 32-bit milliseconds".to_string());
        }

        if self.connect_timeout.as_millis() < 10 {
            errors.push("Connect timeout too short (minimum: 10ms)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("enet-bridge"),
            log_level: Level::INFO,
            log_to_console: true,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
