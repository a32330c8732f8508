//! Error types for peerdrop

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid chunk index: {index}, file has {total} chunks")]
    InvalidChunkIndex { index: u32, total: u32 },

    #[error("Invalid chunk size {chunk_size}: must be between 1 and {max} bytes")]
    InvalidChunkSize { chunk_size: usize, max: usize },

    #[error("{size} bytes in chunks of {chunk_size} needs more than {} chunks", u32::MAX)]
    TooManyChunks { size: u64, chunk_size: u64 },

    #[error("Connect timeout: {0}")]
    ConnectTimeout(String),

    #[error("Read timeout: {0}")]
    ReadTimeout(String),

    #[error("Integrity mismatch for {}: expected {expected}, got {actual}", path.display())]
    IntegrityMismatch {
        expected: String,
        actual: String,
        path: PathBuf,
    },

    #[error("{} of {total} chunks failed: {failed:?}", failed.len())]
    ChunksFailed { failed: Vec<u32>, total: u32 },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Registry miss: {0}")]
    RegistryMiss(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("All {attempts} peers failed to deliver {filename}")]
    AllPeersFailed { filename: String, attempts: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
