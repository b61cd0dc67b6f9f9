//! Core proxy module
//!
//! This module contains the protocol-level pieces of the listener:
//! - Protocol parsing (Trojan handshake, addresses, UDP frames)
//! - Replay of peeked bytes for the fallback path
//! - Bidirectional TCP relay
//! - Hook traits for extensibility

pub mod hooks;
mod protocol;
mod relay;
mod rewind;
mod server;

pub use hooks::{Authenticator, StatsCollector, TrafficSnapshot, TrafficStats};
pub use protocol::{Address, TrojanCmd, TrojanRequest, TrojanUdpPacket};
pub use relay::{copy_bidirectional_with_stats, dial, relay_tcp, RelayStats};
pub use rewind::RewindConn;
pub use server::{Server, ServerBuilder};
