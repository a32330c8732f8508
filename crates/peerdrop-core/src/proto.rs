//! Wire message definitions
//!
//! Messages are `|`-separated byte strings. Each protocol state has its own
//! message type so handlers match exhaustively on what can legally arrive:
//!
//! | state         | inbound (server) | outbound (server)          |
//! |---------------|------------------|----------------------------|
//! | AWAIT_HELLO   | [`Hello`]        | [`Session`]                |
//! | AWAIT_REQUEST | [`Request`]      | [`Response`]               |
//!
//! Only `Hello` and `Session` travel in plaintext; requests and responses are
//! sealed with the session key before framing.

use crate::{hash_to_hex, hex_to_hash, Error, FileMetadata, Result};

pub const DELIMITER: u8 = b'|';

const HELLO: &[u8] = b"HELLO";
const SESSION: &[u8] = b"SESSION";
const META: &[u8] = b"META";
const GET: &[u8] = b"GET";
const DONE: &[u8] = b"DONE";
const ERROR: &[u8] = b"ERROR";
const CHUNK: &[u8] = b"CHUNK";

/// `HELLO|peer_id|public_key_pem`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub peer_id: String,
    pub public_key_pem: Vec<u8>,
}

/// `SESSION|wrapped_key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub wrapped_key: Vec<u8>,
}

/// Client requests, valid once a session exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `META|filename`
    Meta { filename: String },
    /// `GET|filename|chunk_index`
    Get { filename: String, index: u32 },
    /// `DONE`
    Done,
}

/// Server responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `META|filename|size|chunk_size|chunk_count|hash_hex`
    Meta(FileMetadata),
    /// `CHUNK|chunk_index|raw_bytes`
    Chunk { index: u32, data: Vec<u8> },
    /// `ERROR|reason`
    Error(String),
}

fn violation(msg: impl Into<String>) -> Error {
    Error::ProtocolViolation(msg.into())
}

fn join(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(DELIMITER);
        }
        out.extend_from_slice(part);
    }
    out
}

/// Split off the message kind; the rest is returned untouched
fn split_kind(buf: &[u8]) -> (&[u8], Option<&[u8]>) {
    match buf.iter().position(|&b| b == DELIMITER) {
        Some(pos) => (&buf[..pos], Some(&buf[pos + 1..])),
        None => (buf, None),
    }
}

/// Split the last field off `buf`
fn split_last(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = buf.iter().rposition(|&b| b == DELIMITER)?;
    Some((&buf[..pos], &buf[pos + 1..]))
}

fn utf8(field: &[u8], what: &str) -> Result<String> {
    String::from_utf8(field.to_vec()).map_err(|_| violation(format!("{} is not valid UTF-8", what)))
}

fn number<T: std::str::FromStr>(field: &[u8], what: &str) -> Result<T> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| violation(format!("invalid {}", what)))
}

impl Hello {
    pub fn encode(&self) -> Vec<u8> {
        join(&[HELLO, self.peer_id.as_bytes(), &self.public_key_pem])
    }

    /// Exactly three fields; anything else is a protocol violation
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let fields: Vec<&[u8]> = buf.split(|&b| b == DELIMITER).collect();
        match fields.as_slice() {
            [kind, peer_id, public_key] if *kind == HELLO => {
                if peer_id.is_empty() || public_key.is_empty() {
                    return Err(violation("HELLO with empty field"));
                }
                Ok(Self {
                    peer_id: utf8(peer_id, "peer id")?,
                    public_key_pem: public_key.to_vec(),
                })
            }
            [kind, ..] if *kind == HELLO => Err(violation(format!(
                "HELLO has {} fields, expected 3",
                fields.len()
            ))),
            _ => Err(violation("expected HELLO")),
        }
    }
}

impl Session {
    pub fn encode(&self) -> Vec<u8> {
        join(&[SESSION, &self.wrapped_key])
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        match split_kind(buf) {
            (SESSION, Some(wrapped_key)) if !wrapped_key.is_empty() => Ok(Self {
                wrapped_key: wrapped_key.to_vec(),
            }),
            _ => Err(violation("expected SESSION")),
        }
    }
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::Meta { filename } => join(&[META, filename.as_bytes()]),
            Request::Get { filename, index } => {
                join(&[GET, filename.as_bytes(), index.to_string().as_bytes()])
            }
            Request::Done => DONE.to_vec(),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        match split_kind(buf) {
            (META, Some(filename)) if !filename.is_empty() => Ok(Request::Meta {
                filename: utf8(filename, "filename")?,
            }),
            (GET, Some(rest)) => {
                // Index is the last field so filenames may contain the delimiter
                let (filename, index) =
                    split_last(rest).ok_or_else(|| violation("GET without chunk index"))?;
                if filename.is_empty() {
                    return Err(violation("GET without filename"));
                }
                Ok(Request::Get {
                    filename: utf8(filename, "filename")?,
                    index: number(index, "chunk index")?,
                })
            }
            (DONE, None) => Ok(Request::Done),
            (kind, _) => Err(violation(format!(
                "unexpected request '{}'",
                String::from_utf8_lossy(kind)
            ))),
        }
    }
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::Meta(meta) => join(&[
                META,
                meta.filename.as_bytes(),
                meta.size.to_string().as_bytes(),
                meta.chunk_size.to_string().as_bytes(),
                meta.chunk_count.to_string().as_bytes(),
                hash_to_hex(&meta.content_hash).as_bytes(),
            ]),
            Response::Chunk { index, data } => join(&[CHUNK, index.to_string().as_bytes(), data]),
            Response::Error(reason) => join(&[ERROR, reason.as_bytes()]),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        match split_kind(buf) {
            (META, Some(rest)) => decode_meta(rest).map(Response::Meta),
            (CHUNK, Some(rest)) => {
                // Split once: the payload is opaque binary
                let (index, data) = match split_kind(rest) {
                    (index, Some(data)) => (index, data),
                    (_, None) => return Err(violation("CHUNK without payload")),
                };
                Ok(Response::Chunk {
                    index: number(index, "chunk index")?,
                    data: data.to_vec(),
                })
            }
            (ERROR, reason) => Ok(Response::Error(
                String::from_utf8_lossy(reason.unwrap_or_default()).into_owned(),
            )),
            (kind, _) => Err(violation(format!(
                "unexpected response '{}'",
                String::from_utf8_lossy(kind)
            ))),
        }
    }
}

/// `filename|size|chunk_size|chunk_count|hash`, parsed from the right
fn decode_meta(rest: &[u8]) -> Result<FileMetadata> {
    let malformed = || violation("malformed META response");
    let (rest, hash) = split_last(rest).ok_or_else(malformed)?;
    let (rest, chunk_count) = split_last(rest).ok_or_else(malformed)?;
    let (rest, chunk_size) = split_last(rest).ok_or_else(malformed)?;
    let (filename, size) = split_last(rest).ok_or_else(malformed)?;

    let hash = std::str::from_utf8(hash).map_err(|_| malformed())?;
    let meta = FileMetadata {
        filename: utf8(filename, "filename")?,
        size: number(size, "size")?,
        chunk_size: number(chunk_size, "chunk size")?,
        chunk_count: number(chunk_count, "chunk count")?,
        content_hash: hex_to_hash(hash).map_err(|_| violation("invalid content hash"))?,
    };

    let consistent = meta.chunk_size <= crate::chunk::MAX_CHUNK_SIZE as u64
        && crate::chunk::chunk_count(meta.size, meta.chunk_size) == Some(meta.chunk_count);
    if !consistent {
        return Err(violation(format!(
            "inconsistent META: {} bytes in {} chunks of {}",
            meta.size, meta.chunk_count, meta.chunk_size
        )));
    }
    Ok(meta)
}
