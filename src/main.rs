//! SerialMQ - serial device to MQTT gateway
//!
//! Usage:
//!   serialmq [CONFIG] [OPTIONS]
//!
//! Arguments:
//!   [CONFIG]               Configuration file path (default: /etc/serialmq/config.toml)
//!
//! Options:
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help
//!
//! Environment:
//!   RUST_LOG               Per-module log directives, e.g. `rumqttc=warn`

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use serialmq::config::Config;
use serialmq::Gateway;

const DEFAULT_CONFIG_PATH: &str = "/etc/serialmq/config.toml";

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// Filter at `level`, refined per module by RUST_LOG style `directives`
fn log_filter(level: LogLevel, directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level.to_tracing_level()).into())
        .parse_lossy(directives)
}

/// SerialMQ - serial device to MQTT gateway
#[derive(Parser, Debug)]
#[command(name = "serialmq")]
#[command(author = "SerialMQ Contributors")]
#[command(version)]
#[command(about = "Bridges serial devices to MQTT topics")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(log_level, &directives))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let gateway = match Gateway::new(&config) {
        Ok(gateway) => gateway,
        Err(e) => {
            eprintln!("Error configuring broker connection: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting SerialMQ");
    info!("  Loaded configuration from {}", args.config.display());
    info!("  Broker: {}", config.broker.url);
    match &config.broker.user {
        Some(user) => info!("  Broker user: {}", user),
        None => info!("  Broker user: none (anonymous)"),
    }
    info!("  Client ID: {}", config.broker.client_id);
    info!("  Retry delay: {:?}", config.broker.retry_delay);
    info!(
        "  Scanner: expecting {} device(s), scan every {:?}, idle every {:?}",
        config.scanner.expected_ports,
        config.scanner.scan_interval,
        config.scanner.idle_scan_interval
    );
    info!("  Ports: {}", config.ports.len());
    for port in &config.ports {
        let framing = match &port.delimiter {
            Some(delimiter) => format!("lines {:?}", delimiter),
            None => "raw".to_string(),
        };
        let prefix = if port.node.is_empty() {
            port.topic_prefix.clone()
        } else {
            format!("{}/{}", port.node, port.topic_prefix)
        };
        info!(
            "    - {} -> {} ({}, {})",
            port.path.display(),
            prefix,
            port.serial_settings(),
            framing
        );
    }

    gateway
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_uses_level_without_directives() {
        let filter = log_filter(LogLevel::Debug, "");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_log_filter_accepts_module_directives() {
        let filter = log_filter(LogLevel::Warn, "rumqttc=trace");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn test_log_level_from_config() {
        assert!(matches!(LogLevel::from_config("DEBUG"), LogLevel::Debug));
        assert!(matches!(LogLevel::from_config("bogus"), LogLevel::Info));
    }
}
