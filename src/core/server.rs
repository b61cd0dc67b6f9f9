//! Per-listener shared state
//!
//! The Server struct bundles what every connection handler needs: the
//! authenticator, the stats sink, the runtime knobs and the optional TLS
//! acceptor. It is built once and shared behind an `Arc`.

use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use super::hooks::{Authenticator, StatsCollector, TrafficStats};
use crate::config::ConnConfig;
use crate::error::{Result, TrojanError};

/// Core proxy server state
pub struct Server {
    /// Authenticator for credential validation
    pub authenticator: Arc<dyn Authenticator>,
    /// Statistics collector
    pub stats: Arc<dyn StatsCollector>,
    /// Connection configuration
    pub conn_config: ConnConfig,
    /// TLS acceptor; `None` serves plain TCP
    pub tls: Option<TlsAcceptor>,
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }
}

/// Builder for constructing a Server
#[derive(Default)]
pub struct ServerBuilder {
    authenticator: Option<Arc<dyn Authenticator>>,
    stats: Option<Arc<dyn StatsCollector>>,
    conn_config: Option<ConnConfig>,
    tls: Option<TlsAcceptor>,
}

impl ServerBuilder {
    /// Create a new server builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set authenticator
    pub fn authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(auth);
        self
    }

    /// Set statistics collector
    pub fn stats(mut self, stats: Arc<dyn StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Set connection configuration
    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = Some(config);
        self
    }

    /// Terminate TLS on accepted connections
    pub fn tls(mut self, acceptor: Option<TlsAcceptor>) -> Self {
        self.tls = acceptor;
        self
    }

    /// Build the server
    ///
    /// Fails if no authenticator was set. Stats default to a fresh
    /// [`TrafficStats`], config to [`ConnConfig::default`].
    pub fn build(self) -> Result<Server> {
        let authenticator = self
            .authenticator
            .ok_or_else(|| TrojanError::Config("authenticator is required".to_string()))?;
        let conn_config = self.conn_config.unwrap_or_default();
        if conn_config.dispatch_capacity == 0 {
            return Err(TrojanError::Config(
                "dispatch capacity must be at least 1".to_string(),
            ));
        }
        Ok(Server {
            authenticator,
            stats: self
                .stats
                .unwrap_or_else(|| Arc::new(TrafficStats::new())),
            conn_config,
            tls: self.tls,
        })
    }
}
