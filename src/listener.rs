//! Intercepting listener wrapper
//!
//! [`wrap_listener`] takes over a raw listener and classifies every
//! connection it accepts:
//!
//! - TLS (when configured) is negotiated up front; an `h2` ALPN result goes to
//!   the fallback untouched, since an HTTP/2 preface cannot be peeked and
//!   replayed.
//! - Otherwise the first line is read and checked against the
//!   [`Authenticator`](crate::core::Authenticator). A valid credential runs the
//!   Trojan pipeline in place; anything else is wrapped in a [`RewindConn`]
//!   that replays the consumed bytes and is handed to the fallback consumer.
//!
//! Only fallback connections come out of [`TrojanListener::accept`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::auth::CREDENTIAL_LEN;
use crate::core::{RewindConn, Server};
use crate::error::{Result, TrojanError};
use crate::handler;
use crate::logger::log;
use crate::transport::{ConnectionMeta, RawListener, TransportStream, TransportType};

/// Longest first line read while looking for a credential.
///
/// A credential line is 58 bytes; anything longer cannot authenticate and is
/// replayed as is.
pub const PEEK_LIMIT: u64 = 64;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// A connection handed to the fallback consumer
pub struct Accepted {
    /// Stream positioned at the first byte the client sent
    pub stream: TransportStream,
    pub meta: ConnectionMeta,
}

/// Listener wrapper yielding fallback connections
pub struct TrojanListener {
    rx: Mutex<mpsc::Receiver<Accepted>>,
    closed: CancellationToken,
    local_addr: SocketAddr,
}

/// Take over `inner` and start intercepting its connections.
///
/// Must be called from within a tokio runtime; the accept loop runs on its
/// own task until [`TrojanListener::close`] or drop.
pub fn wrap_listener<L: RawListener>(inner: L, server: Arc<Server>) -> io::Result<TrojanListener> {
    let local_addr = inner.local_addr()?;
    let (tx, rx) = mpsc::channel(server.conn_config.dispatch_capacity);
    let closed = CancellationToken::new();

    tokio::spawn(accept_loop(inner, server, tx, closed.clone(), local_addr));

    log::info!(addr = %local_addr, "Listener wrapped");
    Ok(TrojanListener {
        rx: Mutex::new(rx),
        closed,
        local_addr,
    })
}

impl TrojanListener {
    /// Wait for the next fallback connection.
    ///
    /// Returns [`TrojanError::ListenerClosed`] once the listener is closed,
    /// and never yields a connection after that.
    pub async fn accept(&self) -> Result<Accepted> {
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TrojanError::ListenerClosed),
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                drain(&mut rx);
                Err(TrojanError::ListenerClosed)
            }
            accepted = rx.recv() => accepted.ok_or(TrojanError::ListenerClosed),
        }
    }

    /// Stop accepting. Idempotent; only the first call has an effect.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        // a concurrent accept holding the lock drains on its own
        if let Ok(mut rx) = self.rx.try_lock() {
            drain(&mut rx);
        }
        log::info!(addr = %self.local_addr, "Listener closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Address of the underlying listener
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TrojanListener {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Close the queue and drop whatever was still waiting in it
fn drain(rx: &mut mpsc::Receiver<Accepted>) {
    rx.close();
    while rx.try_recv().is_ok() {}
}

async fn accept_loop<L: RawListener>(
    mut inner: L,
    server: Arc<Server>,
    tx: mpsc::Sender<Accepted>,
    closed: CancellationToken,
    local_addr: SocketAddr,
) {
    loop {
        let (raw, peer_addr) = tokio::select! {
            _ = closed.cancelled() => break,
            result = inner.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!(addr = %local_addr, error = %e, "Accept failed");
                    tokio::select! {
                        _ = closed.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => continue,
                    }
                }
            },
        };

        let meta = ConnectionMeta {
            peer_addr,
            local_addr,
            transport_type: TransportType::Tcp,
            alpn: None,
        };
        tokio::spawn(classify(
            Arc::clone(&server),
            raw,
            meta,
            tx.clone(),
            closed.clone(),
        ));
    }
    log::debug!(addr = %local_addr, "Accept loop stopped");
}

/// Drive one raw connection to either the Trojan pipeline or the fallback
async fn classify<S>(
    server: Arc<Server>,
    raw: S,
    mut meta: ConnectionMeta,
    tx: mpsc::Sender<Accepted>,
    closed: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let peer = meta.peer_addr;
    log::connection(&peer, "accepted");

    let stream: TransportStream = match &server.tls {
        Some(acceptor) => {
            let handshake = tokio::time::timeout(
                server.conn_config.tls_handshake_timeout,
                acceptor.accept(raw),
            );
            match handshake.await {
                Ok(Ok(tls)) => {
                    meta.transport_type = TransportType::Tls;
                    meta.alpn = tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
                    Box::pin(tls)
                }
                Ok(Err(e)) => {
                    log::debug!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    log::debug!(peer = %peer, "TLS handshake timed out");
                    return;
                }
            }
        }
        None => Box::pin(raw),
    };

    if meta.is_h2() {
        log::debug!(peer = %peer, "h2 negotiated, passing through");
        deliver(&tx, &closed, Accepted { stream, meta }).await;
        return;
    }

    let mut reader = BufReader::with_capacity(CREDENTIAL_LEN, stream);
    let mut line = Vec::with_capacity(CREDENTIAL_LEN + 2);
    match (&mut reader).take(PEEK_LIMIT).read_until(b'\n', &mut line).await {
        Ok(0) => {
            log::connection(&peer, "closed before sending data");
            return;
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return,
        Err(e) => {
            log::warn!(peer = %peer, error = %e, "Failed to read first line");
            return;
        }
    }

    let authenticated = credential_of(&line).is_some_and(|c| server.authenticator.validate(c));
    log::authentication(&peer, authenticated);

    if authenticated {
        // the buffered reader is already past the credential line
        if let Err(e) = handler::process_trojan(&server, reader, meta).await {
            log::debug!(peer = %peer, error = %e, "Connection closed with error");
        }
        return;
    }

    let stream: TransportStream = Box::pin(RewindConn::new(reader, line));
    deliver(&tx, &closed, Accepted { stream, meta }).await;
}

/// The candidate credential of a peeked line: terminator stripped, trimmed
fn credential_of(line: &[u8]) -> Option<&str> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    std::str::from_utf8(line).ok().map(str::trim)
}

/// Queue a fallback connection. Waits while the queue is full; drops the
/// connection if the listener closes first.
async fn deliver(tx: &mpsc::Sender<Accepted>, closed: &CancellationToken, accepted: Accepted) {
    let peer = accepted.meta.peer_addr;
    tokio::select! {
        biased;
        _ = closed.cancelled() => {
            log::debug!(peer = %peer, "Listener closed, dropping fallback connection");
        }
        result = tx.send(accepted) => {
            if result.is_err() {
                log::debug!(peer = %peer, "Listener gone, dropping fallback connection");
            }
        }
    }
}
