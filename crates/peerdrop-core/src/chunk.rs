//! File chunking and reassembly

use crate::crypto::{NONCE_LEN, TAG_LEN};
use crate::transport::MAX_FRAME_LEN;
use crate::{error::Result, types::*, Error};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Bytes a sealed `CHUNK|<index>|` frame adds around the payload
const CHUNK_FRAME_OVERHEAD: usize = "CHUNK|4294967295|".len() + NONCE_LEN + TAG_LEN;

/// Largest chunk whose sealed `CHUNK` response still fits in one frame
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_LEN - CHUNK_FRAME_OVERHEAD;

/// Number of chunks needed for `size` bytes, `None` for a zero chunk size
/// or a count beyond `u32`
pub fn chunk_count(size: u64, chunk_size: u64) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    u32::try_from(size.div_ceil(chunk_size)).ok()
}

/// A chunk size must be non-zero and small enough to travel in one frame
pub fn check_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(Error::InvalidChunkSize {
            chunk_size,
            max: MAX_CHUNK_SIZE,
        });
    }
    Ok(())
}

fn checked_chunk_count(size: u64, chunk_size: usize) -> Result<u32> {
    chunk_count(size, chunk_size as u64).ok_or(Error::TooManyChunks {
        size,
        chunk_size: chunk_size as u64,
    })
}

fn open(path: &Path) -> Result<std::fs::File> {
    std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::Io(e),
    })
}

/// Compute a file's metadata, streaming it once in `chunk_size` reads
pub fn file_metadata(path: &Path, chunk_size: usize) -> Result<FileMetadata> {
    check_chunk_size(chunk_size)?;
    let mut file = open(path)?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; chunk_size];
    let mut size = 0u64;

    loop {
        let bytes_read = read_full(&mut file, &mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        size += bytes_read as u64;
    }

    Ok(FileMetadata {
        filename,
        size,
        chunk_size: chunk_size as u64,
        chunk_count: checked_chunk_count(size, chunk_size)?,
        content_hash: hasher.finalize().into(),
    })
}

/// Read chunk `index` of a file. Only the last chunk may be short.
pub fn read_chunk(path: &Path, index: u32, chunk_size: usize) -> Result<Vec<u8>> {
    check_chunk_size(chunk_size)?;
    let mut file = open(path)?;
    let size = file.metadata()?.len();
    let total = checked_chunk_count(size, chunk_size)?;
    if index >= total {
        return Err(Error::InvalidChunkIndex { index, total });
    }

    file.seek(SeekFrom::Start(index as u64 * chunk_size as u64))?;
    let mut buffer = vec![0u8; chunk_size];
    let bytes_read = read_full(&mut file, &mut buffer)?;
    buffer.truncate(bytes_read);
    Ok(buffer)
}

/// Fill `buf` unless EOF comes first; returns the number of bytes read
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Write chunks to `output_path` in ascending index order, returning the
/// SHA-256 of exactly the bytes written
pub fn reassemble_file(
    chunks: &HashMap<u32, Vec<u8>>,
    total_chunks: u32,
    output_path: &Path,
) -> Result<ContentHash> {
    let missing: Vec<u32> = (0..total_chunks)
        .filter(|i| !chunks.contains_key(i))
        .collect();
    if !missing.is_empty() {
        return Err(Error::ChunksFailed {
            failed: missing,
            total: total_chunks,
        });
    }

    let mut writer = BufWriter::new(std::fs::File::create(output_path)?);
    let mut hasher = Sha256::new();
    for index in 0..total_chunks {
        let data = &chunks[&index];
        tracing::trace!("Writing chunk {} ({} bytes)", index, data.len());
        writer.write_all(data)?;
        hasher.update(data);
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;

    Ok(hasher.finalize().into())
}
