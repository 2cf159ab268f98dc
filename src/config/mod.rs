//! Configuration Module
//!
//! Provides TOML-based configuration for SerialMQ with support for:
//! - Broker connection (url, credentials, keepalive, retry delay)
//! - Scanner pacing (expected port count, scan intervals)
//! - Per-port options (`[[port]]`: location, topics, framing, line settings)
//! - Environment variable overrides (SERIALMQ__* prefix)

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::Credentials;
use crate::serial::{Framing, Parity, SerialSettings};


/// Default MQTT port when the url names none
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker connection
    pub broker: BrokerConfig,
    /// Device discovery pacing
    pub scanner: ScannerConfig,
    /// Bridged serial ports, in configuration order
    #[serde(rename = "port")]
    pub ports: Vec<PortConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker url: `mqtt://host:port`, `tcp://host:port` or bare `host[:port]`
    #[serde(default = "default_url")]
    pub url: String,

    /// Username; credentials are presented only when this is set
    pub user: Option<String>,

    /// Password
    pub pass: Option<String>,

    /// Client ID presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,

    /// Upper bound on a single connect attempt
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Delay before retrying after a failed attempt
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// QoS for publishes and subscriptions (0 or 1)
    #[serde(default)]
    pub qos: u8,
}

fn default_url() -> String {
    format!("mqtt://localhost:{}", DEFAULT_MQTT_PORT)
}

fn default_client_id() -> String {
    format!("serialmq-{}", std::process::id())
}

fn default_keepalive() -> u16 {
    30
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            user: None,
            pass: None,
            client_id: default_client_id(),
            keepalive: default_keepalive(),
            connect_timeout: default_connect_timeout(),
            retry_delay: default_retry_delay(),
            qos: 0,
        }
    }
}

impl BrokerConfig {
    /// Parse the url into host and port
    pub fn parse_url(&self) -> Result<(String, u16), ConfigError> {
        let rest = match self.url.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "mqtt" | "tcp" => rest,
                other => {
                    return Err(ConfigError::Validation(format!(
                        "unsupported broker url scheme '{}'",
                        other
                    )))
                }
            },
            None => self.url.as_str(),
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| {
                    ConfigError::Validation(format!("invalid port in broker url '{}'", self.url))
                })?;
                (host, port)
            }
            None => (rest, DEFAULT_MQTT_PORT),
        };

        if host.is_empty() || host.contains('/') {
            return Err(ConfigError::Validation(format!(
                "invalid broker url '{}'",
                self.url
            )));
        }
        Ok((host.to_string(), port))
    }

    /// Credentials to present, if a user is configured
    pub fn credentials(&self) -> Option<Credentials> {
        self.user.as_ref().map(|user| Credentials {
            user: user.clone(),
            pass: self.pass.clone(),
        })
    }

    /// Get the keep-alive interval as Duration
    pub fn keepalive_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.keepalive))
    }
}

/// Device discovery pacing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Number of devices after which the scanner slows down
    #[serde(default = "default_expected_ports")]
    pub expected_ports: usize,

    /// Scan interval while fewer than `expected_ports` devices are open
    #[serde(default = "default_scan_interval", with = "humantime_serde")]
    pub scan_interval: Duration,

    /// Scan interval otherwise
    #[serde(default = "default_idle_scan_interval", with = "humantime_serde")]
    pub idle_scan_interval: Duration,
}

fn default_expected_ports() -> usize {
    1
}

fn default_scan_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_idle_scan_interval() -> Duration {
    Duration::from_millis(60_000)
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            expected_ports: default_expected_ports(),
            scan_interval: default_scan_interval(),
            idle_scan_interval: default_idle_scan_interval(),
        }
    }
}

/// One configured device location and how to bridge it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortConfig {
    /// Device location; may be an alias such as `/dev/serial/by-id/...`
    pub path: PathBuf,

    /// Topic node; empty puts topics directly under the prefix
    #[serde(default)]
    pub node: String,

    /// Topic prefix, also the subscription identity
    pub topic_prefix: String,

    /// Line delimiter; absent means raw byte mode
    #[serde(default)]
    pub delimiter: Option<String>,

    #[serde(default)]
    pub baud_rate: Option<u32>,
    #[serde(default)]
    pub parity: Option<Parity>,
    #[serde(default)]
    pub data_bits: Option<u8>,
    #[serde(default)]
    pub stop_bits: Option<u8>,
}

impl PortConfig {
    /// Raw-mode port with default line settings
    pub fn new(path: impl Into<PathBuf>, topic_prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            node: String::new(),
            topic_prefix: topic_prefix.into(),
            delimiter: None,
            baud_rate: None,
            parity: None,
            data_bits: None,
            stop_bits: None,
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    /// Line settings: overrides merged over the defaults
    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings::with_overrides(
            self.baud_rate,
            self.parity,
            self.data_bits,
            self.stop_bits,
        )
    }

    pub fn framing(&self) -> Framing {
        Framing::from_delimiter(self.delimiter.as_deref())
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `SERIALMQ__` prefix with double underscores for nesting:
    ///    - `SERIALMQ__BROKER__URL=mqtt://other:1883` overrides `broker.url`
    ///    - `SERIALMQ__SCANNER__EXPECTED_PORTS=2` overrides `scanner.expected_ports`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("broker.url", default_url())?
            .set_default("broker.keepalive", i64::from(default_keepalive()))?
            .set_default("broker.connect_timeout", "10s")?
            .set_default("broker.retry_delay", "5s")?
            .set_default("broker.qos", 0)?
            .set_default("scanner.expected_ports", 1)?
            .set_default("scanner.scan_interval", "1s")?
            .set_default("scanner.idle_scan_interval", "60s")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("SERIALMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_broker()?;

        if self.scanner.scan_interval.is_zero() || self.scanner.idle_scan_interval.is_zero() {
            return Err(ConfigError::Validation(
                "scan_interval and idle_scan_interval must be non-zero".to_string(),
            ));
        }

        if self.ports.is_empty() {
            return Err(ConfigError::Validation(
                "at least one [[port]] must be configured".to_string(),
            ));
        }

        let mut paths = HashSet::new();
        for port in &self.ports {
            if port.path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "port path must not be empty".to_string(),
                ));
            }
            if !paths.insert(&port.path) {
                return Err(ConfigError::Validation(format!(
                    "port '{}' is configured more than once",
                    port.path.display()
                )));
            }
            validate_port(port)?;
        }

        Ok(())
    }

    fn validate_broker(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        broker.parse_url()?;

        if broker.qos > 1 {
            return Err(ConfigError::Validation("qos must be 0 or 1".to_string()));
        }
        if broker.pass.is_some() && broker.user.is_none() {
            return Err(ConfigError::Validation(
                "broker pass is set without a user".to_string(),
            ));
        }
        if broker.client_id.is_empty() || broker.client_id.starts_with(' ') {
            return Err(ConfigError::Validation(
                "client_id must be non-empty and must not start with a space".to_string(),
            ));
        }
        if broker.keepalive < 5 {
            return Err(ConfigError::Validation(
                "keepalive must be at least 5 seconds".to_string(),
            ));
        }
        if broker.connect_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "connect_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_port(port: &PortConfig) -> Result<(), ConfigError> {
    let name = port.path.display();

    if port.topic_prefix.is_empty() {
        return Err(ConfigError::Validation(format!(
            "port '{}': topic_prefix must not be empty",
            name
        )));
    }
    if has_wildcard(&port.topic_prefix) {
        return Err(ConfigError::Validation(format!(
            "port '{}': topic_prefix '{}' contains a wildcard",
            name, port.topic_prefix
        )));
    }
    if has_wildcard(&port.node) {
        return Err(ConfigError::Validation(format!(
            "port '{}': node '{}' contains a wildcard",
            name, port.node
        )));
    }
    if let Some(bits) = port.data_bits {
        if !(5..=8).contains(&bits) {
            return Err(ConfigError::Validation(format!(
                "port '{}': data_bits must be between 5 and 8",
                name
            )));
        }
    }
    if let Some(bits) = port.stop_bits {
        if bits != 1 && bits != 2 {
            return Err(ConfigError::Validation(format!(
                "port '{}': stop_bits must be 1 or 2",
                name
            )));
        }
    }
    if port.delimiter.as_deref() == Some("") {
        return Err(ConfigError::Validation(format!(
            "port '{}': delimiter must not be empty; omit it for raw mode",
            name
        )));
    }
    Ok(())
}

fn has_wildcard(segment: &str) -> bool {
    segment.contains(['+', '#', '\0'])
}
