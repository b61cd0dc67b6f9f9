//! Bidirectional TCP relay with traffic statistics
//!
//! Dials the CONNECT target and copies both directions until either side
//! finishes. Bytes are counted as they are written, so the counts stay
//! accurate when one direction is cut short.

use pin_project_lite::pin_project;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::protocol::Address;
use crate::error::{Result, TrojanError};
use crate::logger::log;

/// Bytes moved by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client -> destination
    pub upload: u64,
    /// Destination -> client
    pub download: u64,
}

impl std::fmt::Display for RelayStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "up={} down={}", self.upload, self.download)
    }
}

pin_project! {
    /// A writer wrapper that counts the bytes accepted by the inner writer
    pub(crate) struct CountedWriter<W> {
        #[pin]
        inner: W,
        written: Arc<AtomicU64>,
    }
}

impl<W> CountedWriter<W> {
    pub(crate) fn new(inner: W, written: Arc<AtomicU64>) -> Self {
        Self { inner, written }
    }
}

impl<W: AsyncWrite> AsyncWrite for CountedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.written.fetch_add(*n as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = &result {
            this.written.fetch_add(*n as u64, Ordering::Relaxed);
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Dial `target` within `connect_timeout`
pub async fn dial(target: &Address, connect_timeout: Duration) -> Result<TcpStream> {
    let connect = async {
        match target {
            // let the resolver try every address the name maps to
            Address::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
            _ => TcpStream::connect(target.to_socket_addr().await?).await,
        }
    };

    match tokio::time::timeout(connect_timeout, connect).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(TrojanError::Dial {
            target: target.to_string(),
            source,
        }),
        Err(_) => Err(TrojanError::DialTimeout {
            target: target.to_string(),
        }),
    }
}

/// Dial `target` and relay `client` to it until both directions are done
pub async fn relay_tcp<C>(
    client: C,
    target: &Address,
    connect_timeout: Duration,
) -> Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let remote = dial(target, connect_timeout).await?;
    log::debug!(target = %target, "Connected to remote");
    copy_bidirectional_with_stats(client, remote).await
}

/// Copy `client` <-> `remote` and report the bytes moved.
///
/// Upload runs on a spawned task, download on the caller's task. Whichever
/// direction finishes first shuts down its write side and cancels the other,
/// and the function returns only after both have stopped, so the counts are
/// final. A mid-relay I/O error is returned as [`TrojanError::Relay`] with the
/// partial counts.
pub async fn copy_bidirectional_with_stats<A, B>(client: A, remote: B) -> Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let uploaded = Arc::new(AtomicU64::new(0));
    let downloaded = Arc::new(AtomicU64::new(0));

    let (mut client_read, client_write) = tokio::io::split(client);
    let (mut remote_read, remote_write) = tokio::io::split(remote);
    let mut client_write = CountedWriter::new(client_write, Arc::clone(&downloaded));
    let mut remote_write = CountedWriter::new(remote_write, Arc::clone(&uploaded));

    let done = CancellationToken::new();

    let upload_done = done.clone();
    let upload = tokio::spawn(async move {
        let result = tokio::select! {
            r = tokio::io::copy(&mut client_read, &mut remote_write) => r.map(|_| ()),
            _ = upload_done.cancelled() => Ok(()),
        };
        let _ = remote_write.shutdown().await;
        upload_done.cancel();
        result
    });

    let download_result = tokio::select! {
        r = tokio::io::copy(&mut remote_read, &mut client_write) => r.map(|_| ()),
        _ = done.cancelled() => Ok(()),
    };
    let _ = client_write.shutdown().await;
    done.cancel();

    let upload_result = upload.await.unwrap_or_else(|e| Err(io::Error::other(e)));

    let stats = RelayStats {
        upload: uploaded.load(Ordering::Relaxed),
        download: downloaded.load(Ordering::Relaxed),
    };

    match upload_result.and(download_result) {
        Ok(()) => Ok(stats),
        Err(source) => Err(TrojanError::Relay { stats, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_relay_stats_display() {
        let stats = RelayStats {
            upload: 100,
            download: 200,
        };
        assert_eq!(stats.to_string(), "up=100 down=200");
        assert_eq!(RelayStats::default(), RelayStats { upload: 0, download: 0 });
    }

    #[tokio::test]
    async fn test_counted_writer_counts_accepted_bytes() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut writer = CountedWriter::new(Vec::new(), Arc::clone(&counter));
        writer.write_all(b"hello").await.unwrap();
        writer.write_all(b" world").await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 11);
        assert_eq!(writer.inner, b"hello world");
    }

    #[tokio::test]
    async fn test_copy_counts_both_directions() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (remote, mut remote_peer) = tokio::io::duplex(1024);

        let relay = tokio::spawn(copy_bidirectional_with_stats(client, remote));

        client_peer.write_all(b"ping ping").await.unwrap();
        let mut buf = [0u8; 9];
        remote_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping ping");

        remote_peer.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // remote hangs up; the upload side must be torn down too
        drop(remote_peer);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats { upload: 9, download: 4 });

        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_client_close_ends_relay() {
        let (client, client_peer) = tokio::io::duplex(1024);
        let (remote, mut remote_peer) = tokio::io::duplex(1024);

        let relay = tokio::spawn(copy_bidirectional_with_stats(client, remote));
        drop(client_peer);

        // remote observes EOF promptly and the relay returns
        let mut rest = Vec::new();
        remote_peer.read_to_end(&mut rest).await.unwrap();
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats::default());
    }

    #[tokio::test]
    async fn test_relay_tcp_against_echo_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let (client, mut client_peer) = tokio::io::duplex(1024);
        let target = Address::IPv4([127, 0, 0, 1], port);
        let relay = tokio::spawn(async move {
            relay_tcp(client, &target, Duration::from_secs(5)).await
        });

        client_peer.write_all(b"hello").await.unwrap();
        let mut echoed = Vec::new();
        client_peer.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"hello");

        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats { upload: 5, download: 5 });
    }

    #[tokio::test]
    async fn test_dial_failure_moves_no_bytes() {
        // grab a free port, then close it so the connect is refused
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (client, _client_peer) = tokio::io::duplex(64);
        let target = Address::IPv4([127, 0, 0, 1], port);

        let err = relay_tcp(client, &target, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TrojanError::Dial { .. }));
        assert!(err.relay_stats().is_none());
    }
}
