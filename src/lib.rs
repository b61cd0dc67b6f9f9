//! Trojan listener with camouflage fallback
//!
//! Architecture:
//! - `core/`: protocol codec, rewind wrapper, TCP relay and hook traits
//! - `transport/`: stream abstraction, raw listener trait, TLS loading
//! - `auth`: credential store
//! - `udp`: UDP ASSOCIATE relay
//! - `handler`: authenticated connection pipeline
//! - `listener`: the intercepting listener wrapper

pub mod auth;
pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod listener;
pub mod logger;
pub mod transport;
pub mod udp;

pub use error::{Result, TrojanError};
pub use listener::{wrap_listener, Accepted, TrojanListener};
