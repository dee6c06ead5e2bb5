//! Configuration module for the kvhttp server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Smallest accepted read buffer; shorter buffers cannot hold a request line
const MIN_REQUEST_SIZE: usize = 16;

const MAX_REQUEST_SIZE: usize = 1024 * 1024;

const MAX_CONNECTIONS: usize = 65536;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "kvhttp")]
#[command(author = "kvhttp authors")]
#[command(version = "0.1.0")]
#[command(about = "A tiny in-memory key-value store over HTTP", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum bytes read per request
    #[arg(long)]
    pub max_request_size: Option<usize>,

    /// Serve connections concurrently instead of one at a time
    #[arg(long)]
    pub concurrent: bool,

    /// Number of worker threads in concurrent mode (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum in-flight connections in concurrent mode
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Serve connections concurrently
    #[serde(default)]
    pub concurrent: bool,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum in-flight connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            concurrent: false,
            workers: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Wire protocol configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Size of the single read performed per connection
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_request_size: default_max_request_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_request_size() -> usize {
    4096
}

fn default_max_connections() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_request_size: usize,
    pub concurrent: bool,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_request_size: cli
                .max_request_size
                .unwrap_or(toml_config.protocol.max_request_size),
            concurrent: cli.concurrent || toml_config.server.concurrent,
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_REQUEST_SIZE..=MAX_REQUEST_SIZE).contains(&self.max_request_size) {
            return Err(ConfigError::Invalid(format!(
                "max_request_size must be between {MIN_REQUEST_SIZE} and {MAX_REQUEST_SIZE}, got {}",
                self.max_request_size
            )));
        }
        if !(1..=MAX_CONNECTIONS).contains(&self.max_connections) {
            return Err(ConfigError::Invalid(format!(
                "max_connections must be between 1 and {MAX_CONNECTIONS}, got {}",
                self.max_connections
            )));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid(
                "workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
