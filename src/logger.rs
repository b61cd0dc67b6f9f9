use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_logger(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("trojan_listener={}", level.as_str())));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, trace, warn};

    use crate::core::{Address, RelayStats, TrojanCmd};
    use std::net::SocketAddr;

    /// Record a connection lifecycle event
    pub fn connection(peer: &SocketAddr, event: &str) {
        debug!(peer = %peer, event = event, "Connection");
    }

    /// Record an authentication outcome.
    ///
    /// Failures go to debug: a failed credential is ordinary fallback traffic.
    pub fn authentication(peer: &SocketAddr, success: bool) {
        if success {
            debug!(peer = %peer, "Authentication successful");
        } else {
            debug!(peer = %peer, "Authentication failed, serving fallback");
        }
    }

    /// One record per finished relay
    pub fn relay(peer: &SocketAddr, cmd: TrojanCmd, target: &Address, stats: &RelayStats) {
        info!(
            peer = %peer,
            cmd = %cmd,
            target = %target,
            upload = stats.upload,
            download = stats.download,
            "Relay finished"
        );
    }
}
