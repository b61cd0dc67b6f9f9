//! Transport layer abstraction
//!
//! The listener wrapper consumes any [`RawListener`] and hands out
//! type-erased [`TransportStream`]s, whether the connection was plain TCP,
//! TLS terminated here, or a replayed fallback connection.

pub mod tls;

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Unified transport stream trait combining AsyncRead + AsyncWrite + Send + Unpin
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Unified transport stream type
pub type TransportStream = Pin<Box<dyn AsyncStream>>;

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Plain TCP
    Tcp,
    /// TLS terminated by the listener
    Tls,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Tcp => write!(f, "tcp"),
            TransportType::Tls => write!(f, "tls"),
        }
    }
}

/// Connection metadata
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    /// Client peer address
    pub peer_addr: SocketAddr,
    /// Address the connection was accepted on
    pub local_addr: SocketAddr,
    /// Transport type
    pub transport_type: TransportType,
    /// Negotiated ALPN protocol, if TLS negotiated one
    pub alpn: Option<Vec<u8>>,
}

impl ConnectionMeta {
    /// True when the client negotiated HTTP/2
    pub fn is_h2(&self) -> bool {
        tls::is_h2(self.alpn.as_deref())
    }
}

/// Source of raw connections the listener wrapper intercepts
#[async_trait]
pub trait RawListener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Accept the next raw connection
    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Address the listener is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl RawListener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(&*self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_type_display() {
        assert_eq!(format!("{}", TransportType::Tcp), "tcp");
        assert_eq!(format!("{}", TransportType::Tls), "tls");
    }

    #[test]
    fn test_connection_meta_is_h2() {
        let mut meta = ConnectionMeta {
            peer_addr: "127.0.0.1:1234".parse().unwrap(),
            local_addr: "127.0.0.1:443".parse().unwrap(),
            transport_type: TransportType::Tls,
            alpn: Some(b"h2".to_vec()),
        };
        assert!(meta.is_h2());

        meta.alpn = Some(b"http/1.1".to_vec());
        assert!(!meta.is_h2());

        meta.alpn = None;
        assert!(!meta.is_h2());
    }

    #[tokio::test]
    async fn test_tcp_raw_listener_accept() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = RawListener::local_addr(&listener).unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (_stream, peer) = RawListener::accept(&mut listener).await.unwrap();
        let client = client.await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }
}
