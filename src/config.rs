//! Configuration module for the uptime server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::logging::LogLevel;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(author = "remote-uptime authors")]
#[command(version = "0.1.0")]
#[command(about = "Reports system uptime to TCP clients, one process per connection", long_about = None)]
pub struct CliArgs {
    /// Port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Enable debug logging (same as --log-level debug)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (defaults to all interfaces)
    #[arg(short = 'l', long)]
    pub host: Option<String>,

    /// Listen backlog for pending connections
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Receive deadline for a connection, in milliseconds
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Skip connection hardening (no receive deadline)
    #[arg(long)]
    pub no_harden: bool,

    /// How each connection is isolated
    #[arg(long, value_enum)]
    pub isolation: Option<Isolation>,

    /// Log level
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Run as a connection worker; the connection is file descriptor 0
    #[arg(long, hide = true, value_name = "SETTINGS")]
    pub worker: Option<String>,
}

/// Isolation unit used for each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// A separate OS process per connection.
    #[default]
    Process,
    /// A dedicated thread per connection. Shares the address space with the
    /// listener, so a crashing handler takes the whole server down.
    Thread,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    pub port: Option<u16>,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Pause after answering SERVER_BUSY, in milliseconds
    #[serde(default = "default_busy_backoff_ms")]
    pub busy_backoff_ms: u64,
    /// Isolation unit per connection
    #[serde(default)]
    pub isolation: Isolation,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            backlog: default_backlog(),
            busy_backoff_ms: default_busy_backoff_ms(),
            isolation: Isolation::default(),
        }
    }
}

/// Settings a worker needs to serve one connection.
///
/// Serialized to TOML and handed to worker processes on their command line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Set the receive deadline before reading
    #[serde(default = "default_harden")]
    pub harden: bool,
    /// Receive deadline in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Capacity of the request buffer and cap on the reply size
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Program run for GET_SYS_INFO
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            harden: default_harden(),
            read_timeout_ms: default_read_timeout_ms(),
            buffer_size: default_buffer_size(),
            command: default_command(),
            args: Vec::new(),
        }
    }
}

impl WorkerConfig {
    /// Encode for a worker process command line.
    pub fn to_settings(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(ConfigError::Encode)
    }

    /// Decode settings received on a worker process command line.
    pub fn from_settings(settings: &str) -> Result<Self, ConfigError> {
        toml::from_str(settings).map_err(ConfigError::Settings)
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default)]
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> i32 {
    10
}

fn default_busy_backoff_ms() -> u64 {
    1000 // 1 second
}

fn default_harden() -> bool {
    true
}

fn default_read_timeout_ms() -> u64 {
    5000 // 5 seconds
}

fn default_buffer_size() -> usize {
    1024
}

fn default_command() -> String {
    "uptime".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub busy_backoff_ms: u64,
    pub isolation: Isolation,
    pub log_level: LogLevel,
    pub worker: WorkerConfig,
}

impl Config {
    /// Resolve configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let port = cli
            .port
            .or(toml_config.server.port)
            .ok_or(ConfigError::MissingPort)?;
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }

        let mut worker = toml_config.worker;
        if let Some(read_timeout_ms) = cli.read_timeout_ms {
            worker.read_timeout_ms = read_timeout_ms;
        }
        if cli.no_harden {
            worker.harden = false;
        }
        if worker.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }

        let log_level = if cli.debug {
            LogLevel::Debug
        } else {
            cli.log_level.unwrap_or(toml_config.logging.level)
        };

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            busy_backoff_ms: toml_config.server.busy_backoff_ms,
            isolation: cli.isolation.unwrap_or(toml_config.server.isolation),
            log_level,
            worker,
        })
    }

    /// Listen address in `host:port` form.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingPort,
    InvalidPort(u16),
    InvalidBufferSize,
    Encode(toml::ser::Error),
    Settings(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::MissingPort => write!(f, "No port given (usage: server [-d] <port>)"),
            ConfigError::InvalidPort(port) => write!(f, "Invalid port number: {port}"),
            ConfigError::InvalidBufferSize => write!(f, "Worker buffer_size must be non-zero"),
            ConfigError::Encode(e) => write!(f, "Failed to encode worker settings: {e}"),
            ConfigError::Settings(e) => write!(f, "Invalid worker settings: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("server").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, None);
        assert_eq!(config.server.backlog, 10);
        assert_eq!(config.server.busy_backoff_ms, 1000);
        assert_eq!(config.server.isolation, Isolation::Process);
        assert!(config.worker.harden);
        assert_eq!(config.worker.read_timeout_ms, 5000);
        assert_eq!(config.worker.buffer_size, 1024);
        assert_eq!(config.worker.command, "uptime");
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            backlog = 64
            busy_backoff_ms = 50
            isolation = "thread"

            [worker]
            harden = false
            read_timeout_ms = 250
            command = "echo"
            args = ["up", "3 days"]

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, Some(9000));
        assert_eq!(config.server.backlog, 64);
        assert_eq!(config.server.busy_backoff_ms, 50);
        assert_eq!(config.server.isolation, Isolation::Thread);
        assert!(!config.worker.harden);
        assert_eq!(config.worker.read_timeout_ms, 250);
        assert_eq!(config.worker.buffer_size, 1024);
        assert_eq!(config.worker.command, "echo");
        assert_eq!(config.worker.args, vec!["up", "3 days"]);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_cli_takes_precedence() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            [worker]
            read_timeout_ms = 250
            [logging]
            level = "none"
        "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["-d", "--read-timeout-ms", "100", "--no-harden", "7000"]),
            toml_config,
        )
        .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.worker.read_timeout_ms, 100);
        assert!(!config.worker.harden);
        assert_eq!(config.listen_addr(), "0.0.0.0:7000");
    }

    #[test]
    fn test_port_from_file_only() {
        let toml_config: TomlConfig = toml::from_str("[server]\nport = 4242\n").unwrap();
        let config = Config::merge(cli(&[]), toml_config).unwrap();
        assert_eq!(config.port, 4242);
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_missing_port() {
        let err = Config::merge(cli(&[]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPort));
    }

    #[test]
    fn test_invalid_port_rejected_by_cli() {
        assert!(CliArgs::try_parse_from(["server", "0"]).is_err());
        assert!(CliArgs::try_parse_from(["server", "70000"]).is_err());
        assert!(CliArgs::try_parse_from(["server", "http"]).is_err());
    }

    #[test]
    fn test_worker_settings_round_trip() {
        let worker = WorkerConfig {
            harden: false,
            read_timeout_ms: 42,
            buffer_size: 512,
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo 'a b'".to_string()],
        };

        let settings = worker.to_settings().unwrap();
        assert_eq!(WorkerConfig::from_settings(&settings).unwrap(), worker);
    }

    #[test]
    fn test_worker_flag_is_hidden_but_parsed() {
        let args = cli(&["--worker", "harden = true"]);
        assert_eq!(args.worker.as_deref(), Some("harden = true"));
        assert_eq!(args.port, None);
    }
}
