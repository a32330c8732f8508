//! Peer server for sharing a directory with other peers
//!
//! Every accepted connection gets its own task: handshake, then a loop
//! answering `META` and `GET` until `DONE`, EOF, or a frame that fails to
//! open or parse.

use peerdrop_core::proto::{Request, Response};
use peerdrop_core::{chunk, Error, FileMetadata, Result, SecureChannel, TransportConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

/// Read-only view of the shared directory
pub struct ChunkStore {
    /// Directory whose regular files are served
    root: PathBuf,
    chunk_size: usize,
}

impl ChunkStore {
    /// Fails for a chunk size whose `CHUNK` response could not be framed
    pub fn new(root: PathBuf, chunk_size: usize) -> Result<Self> {
        chunk::check_chunk_size(chunk_size)?;
        Ok(Self { root, chunk_size })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Map a requested name to a regular file directly inside the root.
    /// Anything that could escape the root is simply not found.
    fn resolve(&self, filename: &str) -> Result<PathBuf> {
        let not_found = || Error::NotFound(filename.to_string());
        if filename.is_empty()
            || filename == "."
            || filename == ".."
            || filename.contains(['/', '\\', '\0'])
        {
            return Err(not_found());
        }

        let path = self.root.join(filename);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(not_found()),
        }
    }

    /// Metadata for a shared file, hashing it on the blocking pool
    pub async fn metadata(self: &Arc<Self>, filename: &str) -> Result<FileMetadata> {
        let store = Arc::clone(self);
        let filename = filename.to_string();
        tokio::task::spawn_blocking(move || {
            let path = store.resolve(&filename)?;
            chunk::file_metadata(&path, store.chunk_size)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    /// Bytes of chunk `index` of a shared file
    pub async fn read_chunk(self: &Arc<Self>, filename: &str, index: u32) -> Result<Vec<u8>> {
        let store = Arc::clone(self);
        let filename = filename.to_string();
        tokio::task::spawn_blocking(move || {
            let path = store.resolve(&filename)?;
            chunk::read_chunk(&path, index, store.chunk_size)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    /// Names of the regular files in the shared directory, sorted
    pub fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => files.push(name),
                Err(name) => tracing::warn!("Skipping non UTF-8 filename {:?}", name),
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Serves a [`ChunkStore`] over encrypted peer connections
#[derive(Clone)]
pub struct PeerServer {
    store: Arc<ChunkStore>,
    transport: TransportConfig,
}

impl PeerServer {
    pub fn new(store: ChunkStore, transport: TransportConfig) -> Self {
        Self {
            store: Arc::new(store),
            transport,
        }
    }

    /// Accept connections forever, one task per connection
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "Serving {} on {} in {} byte chunks",
            self.store.root().display(),
            listener.local_addr()?,
            self.store.chunk_size()
        );

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Error accepting connection: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
            }

            let server = self.clone();
            tokio::spawn(async move {
                tracing::debug!("Connection from {}", addr);
                match server.handle_connection(stream).await {
                    Ok(()) => tracing::debug!("Connection from {} closed", addr),
                    Err(e) => tracing::warn!("Dropped connection from {}: {}", addr, e),
                }
            });
        }
    }

    /// Drive one connection from HELLO to close
    pub async fn handle_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut channel = SecureChannel::accept(stream, &self.transport).await?;
        let peer = channel.peer_id().unwrap_or("unknown").to_string();
        tracing::debug!("Session established with {}", short(&peer));

        loop {
            let request = match channel.recv_request().await? {
                Some(request) => request,
                None => {
                    tracing::debug!("{} disconnected without DONE", short(&peer));
                    return Ok(());
                }
            };

            let response = match request {
                Request::Done => return Ok(()),
                Request::Meta { filename } => self.handle_meta(&filename).await,
                Request::Get { filename, index } => self.handle_get(&filename, index).await,
            };
            channel.send_response(&response).await?;
        }
    }

    async fn handle_meta(&self, filename: &str) -> Response {
        tracing::info!("Metadata request: {}", filename);
        match self.store.metadata(filename).await {
            Ok(meta) => Response::Meta(meta),
            Err(e) => error_response(filename, e),
        }
    }

    async fn handle_get(&self, filename: &str, index: u32) -> Response {
        tracing::debug!("Chunk request: {} chunk {}", filename, index);
        match self.store.read_chunk(filename, index).await {
            Ok(data) => Response::Chunk { index, data },
            Err(e) => error_response(filename, e),
        }
    }
}

fn error_response(filename: &str, error: Error) -> Response {
    match error {
        Error::NotFound(_) => {
            tracing::warn!("File not found: {}", filename);
            Response::Error(format!("File not found: {}", filename))
        }
        Error::InvalidChunkIndex { index, total } => {
            tracing::warn!("Invalid chunk index {} for {}", index, filename);
            Response::Error(format!(
                "Invalid chunk index: {} ({} has {} chunks)",
                index, filename, total
            ))
        }
        other => {
            tracing::error!("Failed to read {}: {}", filename, other);
            Response::Error(format!("Failed to read {}", filename))
        }
    }
}

fn short(peer_id: &str) -> &str {
    peer_id.get(..8).unwrap_or(peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdrop_core::transport::write_frame;
    use peerdrop_core::Identity;
    use std::sync::OnceLock;
    use tempfile::TempDir;
    use tokio::io::duplex;

    const SMALL_CHUNK: usize = 1000;

    fn client_identity() -> &'static Identity {
        static IDENTITY: OnceLock<Identity> = OnceLock::new();
        IDENTITY.get_or_init(|| Identity::generate().unwrap())
    }

    fn shared_dir() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(temp_dir.path().join("data.bin"), data).unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"hello").unwrap();
        std::fs::create_dir(temp_dir.path().join("subdir")).unwrap();
        temp_dir
    }

    fn server_for(dir: &TempDir) -> PeerServer {
        let store = ChunkStore::new(dir.path().to_path_buf(), SMALL_CHUNK).unwrap();
        PeerServer::new(store, TransportConfig::default())
    }

    #[test]
    fn test_list_files_skips_directories() {
        let dir = shared_dir();
        let store = ChunkStore::new(dir.path().to_path_buf(), SMALL_CHUNK).unwrap();
        assert_eq!(store.list_files().unwrap(), vec!["data.bin", "notes.txt"]);
    }

    #[test]
    fn test_store_rejects_unframeable_chunk_sizes() {
        let dir = shared_dir();
        let root = dir.path().to_path_buf();

        for chunk_size in [0, chunk::MAX_CHUNK_SIZE + 1, 32 * 1024 * 1024] {
            assert!(matches!(
                ChunkStore::new(root.clone(), chunk_size),
                Err(Error::InvalidChunkSize { .. })
            ));
        }
        let store = ChunkStore::new(root, chunk::MAX_CHUNK_SIZE).unwrap();
        assert_eq!(store.chunk_size(), chunk::MAX_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn test_store_rejects_escapes() {
        let dir = shared_dir();
        let store = Arc::new(ChunkStore::new(dir.path().to_path_buf(), SMALL_CHUNK).unwrap());

        for name in ["", ".", "..", "../outside.txt", "subdir", "subdir/x", "missing.bin"] {
            assert!(
                matches!(store.metadata(name).await, Err(Error::NotFound(_))),
                "{:?} should not resolve",
                name
            );
        }
        assert_eq!(store.metadata("data.bin").await.unwrap().chunk_count, 3);
    }

    #[tokio::test]
    async fn test_missing_file_then_valid_request_same_connection() {
        let dir = shared_dir();
        let server = server_for(&dir);
        let (client_io, server_io) = duplex(64 * 1024);
        let handle = tokio::spawn(async move { server.handle_connection(server_io).await });

        let mut channel =
            SecureChannel::initiate(client_io, client_identity(), &TransportConfig::default())
                .await
                .unwrap();

        let response = channel
            .request(&Request::Meta { filename: "ghost.txt".to_string() })
            .await
            .unwrap();
        match response {
            Response::Error(reason) => assert!(reason.contains("ghost.txt"), "{}", reason),
            other => panic!("expected ERROR, got {:?}", other),
        }

        let response = channel
            .request(&Request::Meta { filename: "data.bin".to_string() })
            .await
            .unwrap();
        match response {
            Response::Meta(meta) => {
                assert_eq!(meta.filename, "data.bin");
                assert_eq!(meta.size, 2500);
                assert_eq!(meta.chunk_size, SMALL_CHUNK as u64);
                assert_eq!(meta.chunk_count, 3);
            }
            other => panic!("expected META, got {:?}", other),
        }

        channel.finish().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_chunks_and_index_errors() {
        let dir = shared_dir();
        let server = server_for(&dir);
        let (client_io, server_io) = duplex(64 * 1024);
        let handle = tokio::spawn(async move { server.handle_connection(server_io).await });

        let mut channel =
            SecureChannel::initiate(client_io, client_identity(), &TransportConfig::default())
                .await
                .unwrap();

        let get = |index| Request::Get {
            filename: "data.bin".to_string(),
            index,
        };

        match channel.request(&get(2)).await.unwrap() {
            Response::Chunk { index, data } => {
                assert_eq!(index, 2);
                assert_eq!(data.len(), 500);
                assert_eq!(data[0], (2000 % 256) as u8);
            }
            other => panic!("expected CHUNK, got {:?}", other),
        }

        assert_eq!(
            channel.request(&get(3)).await.unwrap(),
            Response::Error("Invalid chunk index: 3 (data.bin has 3 chunks)".to_string())
        );

        let missing = Request::Get {
            filename: "ghost.bin".to_string(),
            index: 0,
        };
        assert_eq!(
            channel.request(&missing).await.unwrap(),
            Response::Error("File not found: ghost.bin".to_string())
        );

        // Disconnect without DONE is fine
        drop(channel);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_request_before_hello_drops_connection() {
        let dir = shared_dir();
        let server = server_for(&dir);
        let (mut client_io, server_io) = duplex(64 * 1024);

        write_frame(&mut client_io, b"META|data.bin").await.unwrap();
        let result = server.handle_connection(server_io).await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_unknown_request_ends_loop() {
        let dir = shared_dir();
        let server = server_for(&dir);
        let (client_io, server_io) = duplex(64 * 1024);
        let handle = tokio::spawn(async move { server.handle_connection(server_io).await });

        let mut channel =
            SecureChannel::initiate(client_io, client_identity(), &TransportConfig::default())
                .await
                .unwrap();
        channel.send(b"LIST|everything").await.unwrap();

        assert!(matches!(handle.await.unwrap(), Err(Error::ProtocolViolation(_))));
        assert!(channel.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_serves_many_connections() {
        let dir = shared_dir();
        let server = server_for(&dir);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.run(listener).await });

        let mut sessions = Vec::new();
        for _ in 0..3 {
            let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let channel =
                SecureChannel::initiate(stream, client_identity(), &TransportConfig::default())
                    .await
                    .unwrap();
            sessions.push(channel);
        }

        for channel in sessions.iter_mut() {
            let response = channel
                .request(&Request::Meta { filename: "notes.txt".to_string() })
                .await
                .unwrap();
            assert!(matches!(response, Response::Meta(meta) if meta.size == 5));
        }
    }
}
