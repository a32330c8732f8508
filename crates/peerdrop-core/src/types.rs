//! Core data types for peerdrop

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 32-byte SHA-256 hash
pub type ContentHash = [u8; 32];

/// Metadata for a shared file, as advertised in a `META` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Original filename
    pub filename: String,
    /// File size in bytes
    pub size: u64,
    /// Chunk size the serving peer uses for this file
    pub chunk_size: u64,
    /// Number of chunks, `ceil(size / chunk_size)`
    pub chunk_count: u32,
    /// SHA-256 of the full file contents
    pub content_hash: ContentHash,
}

impl FileMetadata {
    /// Expected length of the chunk at `index`, or `None` if out of range
    pub fn chunk_len(&self, index: u32) -> Option<u64> {
        if index >= self.chunk_count {
            return None;
        }
        let offset = index as u64 * self.chunk_size;
        Some((self.size - offset).min(self.chunk_size))
    }
}

/// Network location of a peer server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub ip: String,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.contains(':') {
            write!(f, "[{}]:{}", self.ip, self.port)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

impl FromStr for PeerEndpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("missing port in peer address '{}'", s)))?;
        let ip = ip.trim_start_matches('[').trim_end_matches(']');
        if ip.is_empty() {
            return Err(Error::InvalidAddress(format!("missing host in peer address '{}'", s)));
        }
        let port = port
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("invalid port in peer address '{}'", s)))?;
        Ok(Self::new(ip, port))
    }
}

/// Body of `POST /register`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub peer_id: String,
    /// PEM-encoded public key
    pub public_key: String,
    pub port: u16,
    pub files: Vec<String>,
    /// Self-reported address, for peers that know better than the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Reply to `POST /register`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub message: String,
    /// The address the registry recorded for the peer
    pub ip: String,
}

/// Generic success reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Generic failure reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A live peer as returned by `GET /peers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub peer_id: String,
    pub ip: String,
    pub port: u16,
    pub files: Vec<String>,
}

impl PeerSummary {
    pub fn endpoint(&self) -> PeerEndpoint {
        PeerEndpoint::new(self.ip.clone(), self.port)
    }
}

/// Reply to `GET /peers`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerSummary>,
}

/// Helper to format a content hash as hex string
pub fn hash_to_hex(hash: &ContentHash) -> String {
    hex::encode(hash)
}

/// Helper to parse a hex string into a content hash
pub fn hex_to_hash(s: &str) -> Result<ContentHash, hex::FromHexError> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}
