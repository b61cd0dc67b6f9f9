use std::io;
use thiserror::Error;

use crate::core::RelayStats;

/// Errors raised while decoding the Trojan handshake or a UDP frame.
///
/// Every variant is fatal for the connection it was raised on and for no
/// other connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Command byte other than CONNECT (1) or UDP_ASSOCIATE (3)
    #[error("invalid command: {0:#04x}")]
    InvalidCommand(u8),

    /// Address type tag other than 1, 3 or 4
    #[error("invalid address type: {0:#04x}")]
    InvalidAddressType(u8),

    /// Empty or non UTF-8 domain name
    #[error("invalid domain name")]
    InvalidDomain,

    /// Separator bytes were not CR LF
    #[error("missing CRLF")]
    MissingCrlf,

    /// UDP payload longer than the 2-byte length field can describe
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// The stream ended in the middle of a field
    #[error("truncated header")]
    Truncated,

    /// Transport failure while reading a field
    #[error("read error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(err)
        }
    }
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => e,
            ProtocolError::Truncated => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Unified error type of the listener wrapper
#[derive(Error, Debug)]
pub enum TrojanError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("TLS error: {0}")]
    Tls(String),

    /// Outbound TCP connect failed; no bytes were moved
    #[error("dial {target} failed: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Outbound TCP connect did not finish within the connect timeout
    #[error("dial {target} timed out")]
    DialTimeout { target: String },

    /// A relay broke mid-stream; `stats` holds the bytes moved until then
    #[error("relay failed after {stats}: {source}")]
    Relay {
        stats: RelayStats,
        #[source]
        source: io::Error,
    },

    #[error("listener closed")]
    ListenerClosed,
}

impl TrojanError {
    /// Byte counts carried by the error, if the relay got far enough to move any
    pub fn relay_stats(&self) -> Option<RelayStats> {
        match self {
            TrojanError::Relay { stats, .. } => Some(*stats),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for TrojanError {
    fn from(err: toml::de::Error) -> Self {
        TrojanError::Config(format!("TOML parse error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, TrojanError>;
