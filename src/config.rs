//! Configuration module for udp-counter.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::MAX_DATAGRAM_SIZE;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fmt;
use std::net::{AddrParseError, IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Host used when none is configured.
pub const DEFAULT_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 1378;

/// Poll timeout used when none is configured. Bounds shutdown latency.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Address shared by the aggregating server and all of its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: SocketAddr,
}

impl Endpoint {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self {
            addr: SocketAddr::new(host, port),
        }
    }

    /// Endpoint on the IPv4 loopback interface.
    pub fn localhost(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    pub fn host(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(IpAddr::V4(DEFAULT_HOST), DEFAULT_PORT)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl FromStr for Endpoint {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>().map(Endpoint::from)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.addr, f)
    }
}

/// Tuning for the server's listener loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Upper bound on a single readiness wait; also bounds shutdown latency.
    pub poll_timeout: Duration,
    /// Largest datagram accepted; longer ones are rejected undecoded.
    /// At most `MAX_DATAGRAM_SIZE`.
    pub max_datagram_size: usize,
}

impl ListenerOptions {
    /// Reject options the listener cannot run with.
    pub fn validate(&self) -> Result<(), InvalidOptions> {
        if self.poll_timeout.is_zero() {
            return Err(InvalidOptions {
                field: "poll_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_datagram_size == 0 || self.max_datagram_size > MAX_DATAGRAM_SIZE {
            return Err(InvalidOptions {
                field: "max_datagram_size",
                reason: format!("must be between 1 and {}", MAX_DATAGRAM_SIZE),
            });
        }
        Ok(())
    }
}

/// A `ListenerOptions` field out of range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidOptions {
    pub field: &'static str,
    pub reason: String,
}

impl fmt::Display for InvalidOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.field, self.reason)
    }
}

impl std::error::Error for InvalidOptions {}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}

/// How the demo driver aggregates its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum DemoMode {
    /// Workers send increments over UDP to a counter server
    #[default]
    Udp,
    /// Workers return partial counters that are merged in-process
    Local,
}

/// Command-line arguments for the counter demo driver
#[derive(Parser, Debug, Default)]
#[command(name = "udp-counter")]
#[command(author = "udp-counter authors")]
#[command(version = "0.1.0")]
#[command(about = "Aggregate worker increments into one counter over UDP", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server endpoint (e.g., 127.0.0.1:1378)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listener poll timeout in milliseconds
    #[arg(short = 'p', long)]
    pub poll_timeout_ms: Option<u64>,

    /// Number of worker threads to spawn
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Amount each worker adds
    #[arg(short = 'i', long, allow_hyphen_values = true)]
    pub increment: Option<i64>,

    /// Delay before reading the aggregate, in milliseconds
    #[arg(short = 's', long)]
    pub settle_ms: Option<u64>,

    /// Aggregation mode
    #[arg(short = 'm', long, value_enum)]
    pub mode: Option<DemoMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub demo: DemoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Endpoint to bind (server) or send to (clients)
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listener poll timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Receive buffer size per datagram
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

/// Demo driver configuration
#[derive(Debug, Deserialize)]
pub struct DemoConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_increment")]
    pub increment: i64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default)]
    pub mode: DemoMode,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            increment: default_increment(),
            settle_ms: default_settle_ms(),
            mode: DemoMode::default(),
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
    Endpoint::default().to_string()
}

fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT.as_millis() as u64
}

fn default_max_datagram_size() -> usize {
    MAX_DATAGRAM_SIZE
}

fn default_workers() -> usize {
    3
}

fn default_increment() -> i64 {
    10
}

fn default_settle_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: Endpoint,
    pub listener: ListenerOptions,
    pub workers: usize,
    pub increment: i64,
    pub settle: Duration,
    pub mode: DemoMode,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge already-parsed CLI args with the TOML file they name, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
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
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let endpoint = listen
            .parse::<Endpoint>()
            .map_err(|e| ConfigError::InvalidEndpoint(listen.clone(), e))?;

        let poll_timeout_ms = cli
            .poll_timeout_ms
            .unwrap_or(toml_config.server.poll_timeout_ms);
        let listener = ListenerOptions {
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            max_datagram_size: toml_config.server.max_datagram_size,
        };
        listener.validate()?;

        Ok(Config {
            endpoint,
            listener,
            workers: cli.workers.unwrap_or(toml_config.demo.workers),
            increment: cli.increment.unwrap_or(toml_config.demo.increment),
            settle: Duration::from_millis(cli.settle_ms.unwrap_or(toml_config.demo.settle_ms)),
            mode: cli.mode.unwrap_or(toml_config.demo.mode),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidEndpoint(String, AddrParseError),
    InvalidValue(&'static str, String),
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
            ConfigError::InvalidEndpoint(addr, e) => {
                write!(f, "Invalid endpoint '{}': {}", addr, e)
            }
            ConfigError::InvalidValue(key, msg) => write!(f, "Invalid {}: {}", key, msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<InvalidOptions> for ConfigError {
    fn from(e: InvalidOptions) -> Self {
        ConfigError::InvalidValue(e.field, e.reason)
    }
}
