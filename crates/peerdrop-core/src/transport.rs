//! Framed, encrypted peer connections
//!
//! Every message travels in one frame: a 4-byte big-endian length followed by
//! the message bytes. The first exchange is the plaintext handshake
//! (`HELLO` from the connecting peer, `SESSION` back); afterwards each frame
//! carries `nonce || ciphertext || tag` sealed with the session key.
//!
//! [`SecureChannel`] is generic over the byte stream, so tests drive it over
//! in-memory duplex pipes and production drives it over TCP.

use crate::crypto::{self, SessionKey};
use crate::identity::{self, Identity};
use crate::proto::{Hello, Request, Response, Session};
use crate::{Error, PeerEndpoint, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on a single frame, well above one sealed chunk
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Connection behaviour shared by both ends
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Limit on establishing a TCP connection
    pub connect_timeout: Duration,
    /// Limit on waiting for any single frame
    pub read_timeout: Duration,
    /// Accepting side: reject a HELLO whose peer id is not the hash of its key
    pub verify_peer_id: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            verify_peer_id: true,
        }
    }
}

/// Open a TCP connection to a peer within the connect timeout
pub async fn connect(endpoint: &PeerEndpoint, config: &TransportConfig) -> Result<TcpStream> {
    let stream = tokio::time::timeout(
        config.connect_timeout,
        TcpStream::connect((endpoint.ip.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| Error::ConnectTimeout(endpoint.to_string()))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Write one length-prefixed frame
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_LEN {
        return Err(Error::ProtocolViolation(format!(
            "frame of {} bytes exceeds limit",
            data.len()
        )));
    }
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame; `None` means the peer closed cleanly
/// between frames
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::ProtocolViolation("connection closed mid-frame".to_string()));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::ProtocolViolation(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            Error::ProtocolViolation("connection closed mid-frame".to_string())
        }
        _ => Error::Io(e),
    })?;
    Ok(Some(buf))
}

async fn read_frame_within<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> Result<Option<Vec<u8>>> {
    tokio::time::timeout(timeout, read_frame(reader))
        .await
        .map_err(|_| Error::ReadTimeout(format!("no frame within {:?}", timeout)))?
}

/// An established session over a byte stream
pub struct SecureChannel<S> {
    stream: S,
    key: SessionKey,
    read_timeout: Duration,
    /// Remote peer id, known on the accepting side
    peer_id: Option<String>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SecureChannel<S> {
    /// Connecting side: send HELLO, unwrap the session key from SESSION
    pub async fn initiate(mut stream: S, identity: &Identity, config: &TransportConfig) -> Result<Self> {
        let hello = Hello {
            peer_id: identity.peer_id().to_string(),
            public_key_pem: identity.public_key_pem().as_bytes().to_vec(),
        };
        write_frame(&mut stream, &hello.encode()).await?;

        let frame = read_frame_within(&mut stream, config.read_timeout)
            .await?
            .ok_or_else(|| Error::ProtocolViolation("connection closed during handshake".to_string()))?;
        let session = Session::decode(&frame)?;
        let key_bytes = crypto::unwrap_key(identity.private_key(), &session.wrapped_key)?;
        let key = SessionKey::from_slice(&key_bytes)?;

        tracing::trace!("Session established as {}", identity.short_id());
        Ok(Self {
            stream,
            key,
            read_timeout: config.read_timeout,
            peer_id: None,
        })
    }

    /// Accepting side: expect HELLO first, reply with a freshly wrapped key
    pub async fn accept(mut stream: S, config: &TransportConfig) -> Result<Self> {
        let frame = read_frame_within(&mut stream, config.read_timeout)
            .await?
            .ok_or_else(|| Error::ProtocolViolation("connection closed before HELLO".to_string()))?;
        let hello = Hello::decode(&frame)?;
        let public_key = identity::decode_public_key(&hello.public_key_pem)?;

        if config.verify_peer_id && identity::peer_id(&hello.public_key_pem) != hello.peer_id {
            return Err(Error::ProtocolViolation(format!(
                "peer id {} does not match its public key",
                hello.peer_id
            )));
        }

        let key = SessionKey::generate()?;
        let wrapped_key = crypto::wrap_key(&public_key, key.as_bytes())?;
        write_frame(&mut stream, &Session { wrapped_key }.encode()).await?;

        Ok(Self {
            stream,
            key,
            read_timeout: config.read_timeout,
            peer_id: Some(hello.peer_id),
        })
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// Seal and send one message
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<()> {
        let sealed = crypto::seal(&self.key, plaintext)?;
        write_frame(&mut self.stream, &sealed).await
    }

    /// Receive and open one message; `None` when the peer closed cleanly
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        match read_frame_within(&mut self.stream, self.read_timeout).await? {
            Some(sealed) => crypto::open(&self.key, &sealed).map(Some),
            None => Ok(None),
        }
    }

    pub async fn send_request(&mut self, request: &Request) -> Result<()> {
        self.send(&request.encode()).await
    }

    /// `None` when the peer closed cleanly
    pub async fn recv_request(&mut self) -> Result<Option<Request>> {
        match self.recv().await? {
            Some(plaintext) => Request::decode(&plaintext).map(Some),
            None => Ok(None),
        }
    }

    pub async fn send_response(&mut self, response: &Response) -> Result<()> {
        self.send(&response.encode()).await
    }

    /// Send a request and wait for its response
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        self.send_request(request).await?;
        let plaintext = self
            .recv()
            .await?
            .ok_or_else(|| Error::ProtocolViolation("connection closed awaiting response".to_string()))?;
        Response::decode(&plaintext)
    }

    /// Send the advisory DONE and close the write half
    pub async fn finish(mut self) -> Result<()> {
        self.send_request(&Request::Done).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
