//! Trojan listener host
//!
//! Binds the configured address, wraps it, and forwards every fallback
//! connection to the ordinary web server given by `--fallback`.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use trojan_listener::auth::UserStore;
use trojan_listener::config::{CliArgs, ServerConfig};
use trojan_listener::core::Server;
use trojan_listener::logger::{self, log};
use trojan_listener::transport::tls::load_tls_config;
use trojan_listener::{wrap_listener, Accepted, TrojanError, TrojanListener};

const TCP_BACKLOG: i32 = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default crypto provider for rustls
    // This must be done before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let cli = CliArgs::parse_args();
    let config = ServerConfig::from_cli(&cli)?;

    logger::init_logger(config.log_level);

    let users = Arc::new(UserStore::from_secrets(&config.users));
    log::info!(users = users.len(), "Users loaded");

    let tls = match &config.tls {
        Some((cert, key)) => {
            let tls_config = load_tls_config(cert, key).context("failed to load TLS config")?;
            Some(TlsAcceptor::from(tls_config))
        }
        None => {
            log::warn!("No certificate configured, serving plain TCP");
            None
        }
    };

    let server = Arc::new(
        Server::builder()
            .authenticator(users)
            .conn_config(config.conn)
            .tls(tls)
            .build()?,
    );

    let listener = bind_listener(config.listen)?;
    let listener = Arc::new(wrap_listener(listener, server)?);
    log::info!(
        listen = %listener.local_addr(),
        fallback = %config.fallback,
        "Trojan listener started"
    );

    let signal_listener = Arc::clone(&listener);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        signal_listener.close();
    });

    serve_fallback(&listener, Arc::from(config.fallback.as_str())).await;
    log::info!("Shutdown complete");
    Ok(())
}

/// Bind with SO_REUSEADDR and a larger backlog than the tokio default
fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {}", addr))?;
    socket.listen(TCP_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}

async fn serve_fallback(listener: &TrojanListener, fallback: Arc<str>) {
    loop {
        match listener.accept().await {
            Ok(accepted) => {
                tokio::spawn(forward_to_fallback(accepted, Arc::clone(&fallback)));
            }
            Err(TrojanError::ListenerClosed) => break,
            Err(e) => log::error!(error = %e, "Accept failed"),
        }
    }
}

async fn forward_to_fallback(accepted: Accepted, fallback: Arc<str>) {
    let Accepted { mut stream, meta } = accepted;
    let mut upstream = match TcpStream::connect(&*fallback).await {
        Ok(upstream) => upstream,
        Err(e) => {
            log::warn!(
                peer = %meta.peer_addr,
                fallback = %fallback,
                error = %e,
                "Fallback connect failed"
            );
            return;
        }
    };
    let _ = upstream.set_nodelay(true);
    match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
        Ok((up, down)) => {
            log::debug!(peer = %meta.peer_addr, upload = up, download = down, "Fallback finished");
        }
        Err(e) => {
            log::debug!(peer = %meta.peer_addr, error = %e, "Fallback ended with error");
        }
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            _ => {
                log::error!("Failed to install signal handlers");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Shutdown signal received...");
    }
}
