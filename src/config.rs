//! Configuration module for the Trojan listener
//!
//! This module handles CLI argument parsing with environment variable support
//! and the optional TOML file that carries the user list.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logger::LogLevel;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    // Try parsing as humantime duration first (e.g., "60s", "2m", "1h30m")
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    // Fall back to parsing as plain seconds
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// CLI arguments for the Trojan listener
///
/// Supports environment variables with TROJAN_LISTENER_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Trojan listener with camouflage fallback")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Address to accept client connections on
    #[arg(long, env = "TROJAN_LISTENER_LISTEN", default_value = "0.0.0.0:443")]
    pub listen: SocketAddr,

    /// Web server that receives connections without a valid credential
    #[arg(long, env = "TROJAN_LISTENER_FALLBACK", default_value = "127.0.0.1:80")]
    pub fallback: String,

    /// TLS certificate file path (serve plain TCP when absent)
    #[arg(long, env = "TROJAN_LISTENER_CERT_FILE")]
    pub cert_file: Option<PathBuf>,

    /// TLS private key file path
    #[arg(long, env = "TROJAN_LISTENER_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// User secret, repeatable (comma separated in the environment)
    #[arg(long = "user", env = "TROJAN_LISTENER_USERS", value_delimiter = ',')]
    pub users: Vec<String>,

    /// TOML file with additional users and log settings
    #[arg(long, env = "TROJAN_LISTENER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "TROJAN_LISTENER_LOG_MODE")]
    pub log_mode: Option<LogLevel>,

    // ==================== Performance Tuning ====================
    /// TCP connect timeout to target server (default: 5s)
    #[arg(
        long,
        env = "TROJAN_LISTENER_TCP_CONNECT_TIMEOUT",
        default_value = "5s",
        value_parser = parse_duration,
        help_heading = "Performance"
    )]
    pub tcp_connect_timeout: Duration,

    /// Idle window after which a UDP session is released (default: 10m)
    #[arg(
        long,
        env = "TROJAN_LISTENER_UDP_IDLE_TIMEOUT",
        default_value = "10m",
        value_parser = parse_duration,
        help_heading = "Performance"
    )]
    pub udp_idle_timeout: Duration,

    /// TLS handshake timeout (default: 10s)
    #[arg(
        long,
        env = "TROJAN_LISTENER_TLS_HANDSHAKE_TIMEOUT",
        default_value = "10s",
        value_parser = parse_duration,
        help_heading = "Performance"
    )]
    pub tls_handshake_timeout: Duration,

    /// Classified connections queued for the fallback consumer (default: 8)
    #[arg(
        long,
        env = "TROJAN_LISTENER_DISPATCH_CAPACITY",
        default_value_t = 8,
        help_heading = "Performance"
    )]
    pub dispatch_capacity: usize,

    /// Receive buffer per UDP session in bytes (default: 64KB)
    #[arg(
        long,
        env = "TROJAN_LISTENER_UDP_BUFFER_SIZE",
        default_value_t = 64 * 1024,
        help_heading = "Performance"
    )]
    pub udp_buffer_size: usize,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Optional TOML configuration file
///
/// ```toml
/// users = ["secret-a", "secret-b"]
///
/// [log]
/// level = "debug"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSection {
    pub level: Option<String>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> crate::error::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// TLS handshake timeout
    pub tls_handshake_timeout: Duration,
    /// UDP session idle window
    pub udp_idle_timeout: Duration,
    /// Capacity of the queue feeding `accept()`
    pub dispatch_capacity: usize,
    /// Receive buffer per UDP session
    pub udp_buffer_size: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            tls_handshake_timeout: Duration::from_secs(10),
            udp_idle_timeout: Duration::from_secs(10 * 60),
            dispatch_capacity: 8,
            udp_buffer_size: 64 * 1024,
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            connect_timeout: cli.tcp_connect_timeout,
            tls_handshake_timeout: cli.tls_handshake_timeout,
            udp_idle_timeout: cli.udp_idle_timeout,
            dispatch_capacity: cli.dispatch_capacity,
            udp_buffer_size: cli.udp_buffer_size,
        }
    }
}

/// Runtime configuration resolved from CLI args and the optional file
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub fallback: String,
    /// Certificate and key, when TLS is terminated here
    pub tls: Option<(PathBuf, PathBuf)>,
    /// Plaintext secrets, CLI users first
    pub users: Vec<String>,
    pub log_level: LogLevel,
    pub conn: ConnConfig,
}

impl ServerConfig {
    /// Merge CLI args with the config file (if any) and validate the result
    pub fn from_cli(cli: &CliArgs) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::from_path(path)
                .with_context(|| format!("failed to load config file {}", path.display()))?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    fn merge(cli: &CliArgs, file: FileConfig) -> Result<Self> {
        let file_level = match file.log.level.as_deref() {
            Some(level) => Some(
                level
                    .parse::<LogLevel>()
                    .map_err(|e| anyhow!("invalid [log] level: {}", e))?,
            ),
            None => None,
        };

        let tls = match (&cli.cert_file, &cli.key_file) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            (None, None) => None,
            _ => {
                return Err(anyhow!(
                    "--cert_file and --key_file must be given together"
                ))
            }
        };

        let mut users = cli.users.clone();
        users.extend(file.users);

        let config = Self {
            listen: cli.listen,
            fallback: cli.fallback.clone(),
            tls,
            users,
            log_level: cli.log_mode.or(file_level).unwrap_or_default(),
            conn: ConnConfig::from_cli(cli),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the resolved configuration
    pub fn validate(&self) -> Result<()> {
        if self.users.is_empty() {
            return Err(anyhow!("at least one user is required (--user or config file)"));
        }
        if self.users.iter().any(|u| u.is_empty()) {
            return Err(anyhow!("user secrets must not be empty"));
        }
        if self.fallback.is_empty() {
            return Err(anyhow!("fallback address is required"));
        }

        if let Some((cert, key)) = &self.tls {
            if !cert.exists() {
                return Err(anyhow!("TLS certificate file not found: {}", cert.display()));
            }
            if !key.exists() {
                return Err(anyhow!("TLS private key file not found: {}", key.display()));
            }
        }

        if self.conn.connect_timeout.is_zero() {
            return Err(anyhow!("tcp_connect_timeout must be greater than 0"));
        }
        if self.conn.tls_handshake_timeout.is_zero() {
            return Err(anyhow!("tls_handshake_timeout must be greater than 0"));
        }
        if self.conn.udp_idle_timeout.is_zero() {
            return Err(anyhow!("udp_idle_timeout must be greater than 0"));
        }
        if self.conn.dispatch_capacity == 0 {
            return Err(anyhow!("dispatch_capacity must be at least 1"));
        }
        if self.conn.udp_buffer_size == 0 {
            return Err(anyhow!("udp_buffer_size must be greater than 0"));
        }
        Ok(())
    }
}
