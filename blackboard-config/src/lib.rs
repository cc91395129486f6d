use serde::{Deserialize, Serialize};
use std::path::Path;
use std::{fs, io};
use thiserror::Error;

// --- Error Type ---
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

// --- Configuration Sections ---

/// Where the relay listens and which path accepts the WebSocket upgrade.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_path() -> String { "/ws".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
        }
    }
}

impl ServerConfig {
    /// `host:port`, suitable for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Broadcast behavior and per-connection frame limits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Whether a client receives its own messages back.
    #[serde(default = "default_echo_to_sender")]
    pub echo_to_sender: bool,
    /// Largest accepted inbound message in bytes. `None` keeps the
    /// WebSocket library default.
    #[serde(default)]
    pub max_message_size: Option<usize>,
    /// Largest accepted single frame in bytes.
    #[serde(default)]
    pub max_frame_size: Option<usize>,
}

fn default_echo_to_sender() -> bool { true }

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            echo_to_sender: default_echo_to_sender(),
            max_message_size: None,
            max_frame_size: None,
        }
    }
}

// --- Top-Level Config Struct ---

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Validation("Server host cannot be empty.".to_string()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Validation("Server port cannot be zero.".to_string()));
        }
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "WebSocket path must start with '/', got '{}'.",
                self.server.path
            )));
        }
        if self.relay.max_message_size == Some(0) || self.relay.max_frame_size == Some(0) {
            return Err(ConfigError::Validation(
                "Size limits must be greater than zero.".to_string(),
            ));
        }
        let limits = (self.relay.max_message_size, self.relay.max_frame_size);
        if let (Some(message), Some(frame)) = limits {
            if frame > message {
                return Err(ConfigError::Validation(
                    "max_frame_size cannot exceed max_message_size.".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// --- Loading Function ---

/// Loads and validates a config file. Files ending in `.toml` are parsed as
/// TOML, everything else as JSON.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));

    let config: Config = if is_toml {
        toml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };

    config.validate()?;
    Ok(config)
}
