//! peerdrop Core - Shared types, protocols, and utilities
//!
//! This crate provides the building blocks shared by peerdrop peers and the
//! discovery registry: peer identity, the session cryptography, file chunking,
//! the wire protocol, and the framed transport that carries it.

pub mod chunk;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod proto;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use identity::{peer_id, Identity};
pub use transport::{SecureChannel, TransportConfig};
pub use types::*;

/// Default chunk size: 1 MiB
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Default number of chunk fetches in flight per download
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default registry entry time-to-live in seconds
pub const DEFAULT_TTL_SECS: u64 = 60;
