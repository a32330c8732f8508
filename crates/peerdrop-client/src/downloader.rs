//! File downloader module
//!
//! Fetches a file's metadata from one peer, pulls every chunk concurrently
//! (at most `K` in flight), reassembles strictly in index order, and checks
//! the result against the advertised SHA-256.

use crate::config::{Config, SessionMode};
use crate::discovery::RegistryClient;
use parking_lot::Mutex;
use peerdrop_core::proto::{Request, Response};
use peerdrop_core::{
    chunk, hash_to_hex, transport, ContentHash, Error, FileMetadata, Identity, PeerEndpoint,
    Result, SecureChannel, TransportConfig,
};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

/// Download state for tracking progress
#[derive(Debug, Clone)]
pub struct DownloadJob {
    /// File being downloaded
    pub filename: String,
    /// Expected total chunks
    pub total_chunks: u32,
    /// Advertised SHA-256 of the whole file
    pub expected_hash: ContentHash,
    /// Chunks we've received
    pub chunks: HashMap<u32, Vec<u8>>,
}

impl DownloadJob {
    pub fn new(metadata: &FileMetadata) -> Self {
        Self {
            filename: metadata.filename.clone(),
            total_chunks: metadata.chunk_count,
            expected_hash: metadata.content_hash,
            chunks: HashMap::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.len() as u32 == self.total_chunks
    }

    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        (self.chunks.len() as f64 / self.total_chunks as f64) * 100.0
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    /// Store a received chunk and log progress
    pub fn record(&mut self, index: u32, data: Vec<u8>) {
        self.chunks.insert(index, data);
        tracing::debug!(
            "{}: chunk {} received ({}/{}, {:.0}%)",
            self.filename,
            index,
            self.chunks.len(),
            self.total_chunks,
            self.progress()
        );
    }
}

/// Downloads files from peers
#[derive(Clone)]
pub struct PeerClient {
    identity: Arc<Identity>,
    transport: TransportConfig,
    concurrency: usize,
    session_mode: SessionMode,
}

impl PeerClient {
    pub fn new(identity: Arc<Identity>, transport: TransportConfig) -> Self {
        Self {
            identity,
            transport,
            concurrency: peerdrop_core::DEFAULT_CONCURRENCY,
            session_mode: SessionMode::default(),
        }
    }

    /// Client settings taken from the `[transfer]` section
    pub fn from_config(identity: Arc<Identity>, config: &Config) -> Self {
        Self::new(identity, config.client_transport())
            .with_concurrency(config.transfer.max_concurrent_chunks)
            .with_session_mode(config.transfer.session_mode)
    }

    /// Chunk fetches in flight per download, at least one
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_session_mode(mut self, session_mode: SessionMode) -> Self {
        self.session_mode = session_mode;
        self
    }

    /// Connect and complete the handshake
    async fn open(&self, peer: &PeerEndpoint) -> Result<SecureChannel<TcpStream>> {
        let stream = transport::connect(peer, &self.transport).await?;
        SecureChannel::initiate(stream, &self.identity, &self.transport).await
    }

    /// Fetch a file's metadata over a fresh connection
    pub async fn fetch_metadata(&self, peer: &PeerEndpoint, filename: &str) -> Result<FileMetadata> {
        let mut channel = self.open(peer).await?;
        let response = channel
            .request(&Request::Meta {
                filename: filename.to_string(),
            })
            .await?;
        close(channel).await;

        match response {
            Response::Meta(meta) if meta.filename != filename => {
                Err(Error::ProtocolViolation(format!(
                    "asked for metadata of {}, got {}",
                    filename, meta.filename
                )))
            }
            Response::Meta(meta) => {
                tracing::debug!(
                    "{} on {}: {} bytes, {} chunks of {}",
                    filename,
                    peer,
                    meta.size,
                    meta.chunk_count,
                    meta.chunk_size
                );
                Ok(meta)
            }
            Response::Error(reason) => Err(Error::NotFound(reason)),
            Response::Chunk { .. } => Err(Error::ProtocolViolation(
                "CHUNK in reply to META".to_string(),
            )),
        }
    }

    /// Fetch one chunk over a fresh connection
    pub async fn fetch_chunk(
        &self,
        peer: &PeerEndpoint,
        metadata: &FileMetadata,
        index: u32,
    ) -> Result<Vec<u8>> {
        let mut channel = self.open(peer).await?;
        let data = request_chunk(&mut channel, metadata, index).await?;
        close(channel).await;
        Ok(data)
    }

    /// Download `filename` from one peer into `output_dir`
    pub async fn download(
        &self,
        peer: &PeerEndpoint,
        filename: &str,
        output_dir: &Path,
    ) -> Result<PathBuf> {
        let output_name = Path::new(filename)
            .file_name()
            .filter(|name| name.to_str() == Some(filename))
            .ok_or_else(|| Error::NotFound(format!("invalid filename {}", filename)))?;
        let output_path = output_dir.join(output_name);

        let metadata = Arc::new(self.fetch_metadata(peer, filename).await?);
        tracing::info!(
            "Downloading {} from {} ({} bytes, {} chunks, {:?})",
            filename,
            peer,
            metadata.size,
            metadata.chunk_count,
            self.session_mode
        );

        let job = Arc::new(Mutex::new(DownloadJob::new(&metadata)));
        match self.session_mode {
            SessionMode::PerRequest => self.fetch_per_request(peer, &metadata, &job).await,
            SessionMode::Pooled => self.fetch_pooled(peer, &metadata, &job).await,
        }

        let chunks = {
            let mut job = job.lock();
            if !job.is_complete() {
                let failed = job.missing_chunks();
                tracing::error!(
                    "{}: {} of {} chunks failed",
                    filename,
                    failed.len(),
                    metadata.chunk_count
                );
                return Err(Error::ChunksFailed {
                    failed,
                    total: metadata.chunk_count,
                });
            }
            std::mem::take(&mut job.chunks)
        };

        std::fs::create_dir_all(output_dir)?;
        let total = metadata.chunk_count;
        let path = output_path.clone();
        let actual = tokio::task::spawn_blocking(move || chunk::reassemble_file(&chunks, total, &path))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        if actual != metadata.content_hash {
            tracing::error!("{}: hash mismatch, keeping {}", filename, output_path.display());
            return Err(Error::IntegrityMismatch {
                expected: hash_to_hex(&metadata.content_hash),
                actual: hash_to_hex(&actual),
                path: output_path,
            });
        }

        tracing::info!(
            "Downloaded and verified {} ({} bytes) to {}",
            filename,
            metadata.size,
            output_path.display()
        );
        Ok(output_path)
    }

    /// One connection per chunk, gated by a semaphore
    async fn fetch_per_request(
        &self,
        peer: &PeerEndpoint,
        metadata: &Arc<FileMetadata>,
        job: &Arc<Mutex<DownloadJob>>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        let tasks = (0..metadata.chunk_count).map(|index| {
            let client = self.clone();
            let peer = peer.clone();
            let metadata = Arc::clone(metadata);
            let job = Arc::clone(job);
            let semaphore = Arc::clone(&semaphore);

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                match client.fetch_chunk(&peer, &metadata, index).await {
                    Ok(data) => job.lock().record(index, data),
                    Err(e) => tracing::warn!("Chunk {} from {} failed: {}", index, peer, e),
                }
            })
        });

        for joined in futures::future::join_all(tasks).await {
            if let Err(e) = joined {
                tracing::error!("Chunk task failed: {}", e);
            }
        }
    }

    /// `K` long-lived sessions pulling indices from a shared queue
    async fn fetch_pooled(
        &self,
        peer: &PeerEndpoint,
        metadata: &Arc<FileMetadata>,
        job: &Arc<Mutex<DownloadJob>>,
    ) {
        let queue: Arc<Mutex<VecDeque<u32>>> =
            Arc::new(Mutex::new((0..metadata.chunk_count).collect()));
        let workers = self.concurrency.min(metadata.chunk_count as usize);

        let tasks = (0..workers).map(|worker| {
            let client = self.clone();
            let peer = peer.clone();
            let metadata = Arc::clone(metadata);
            let job = Arc::clone(job);
            let queue = Arc::clone(&queue);

            tokio::spawn(async move {
                let mut channel = match client.open(&peer).await {
                    Ok(channel) => channel,
                    Err(e) => {
                        tracing::warn!("Worker {} could not reach {}: {}", worker, peer, e);
                        return;
                    }
                };

                loop {
                    let Some(index) = queue.lock().pop_front() else {
                        break;
                    };
                    match request_chunk(&mut channel, &metadata, index).await {
                        Ok(data) => job.lock().record(index, data),
                        // The session is still sound after an ERROR reply
                        Err(e @ Error::NotFound(_)) => {
                            tracing::warn!("Chunk {} from {} failed: {}", index, peer, e);
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Worker {} lost its session with {} at chunk {}: {}",
                                worker,
                                peer,
                                index,
                                e
                            );
                            return;
                        }
                    }
                }
                close(channel).await;
            })
        });

        for joined in futures::future::join_all(tasks).await {
            if let Err(e) = joined {
                tracing::error!("Download worker failed: {}", e);
            }
        }
    }

    /// Ask the registry who shares `filename` and download from the first
    /// candidate that delivers a verified file
    pub async fn download_via_discovery(
        &self,
        registry: &RegistryClient,
        filename: &str,
        output_dir: &Path,
    ) -> Result<PathBuf> {
        let candidates = registry.find_peers(filename).await?;
        tracing::info!("{} candidate peers for {}", candidates.len(), filename);

        let mut attempts = 0;
        for candidate in &candidates {
            attempts += 1;
            let endpoint = candidate.endpoint();
            match self.download(&endpoint, filename, output_dir).await {
                Ok(path) => return Ok(path),
                Err(e) => tracing::warn!(
                    "Download of {} from {} ({}) failed: {}",
                    filename,
                    endpoint,
                    short(&candidate.peer_id),
                    e
                ),
            }
        }

        Err(Error::AllPeersFailed {
            filename: filename.to_string(),
            attempts,
        })
    }
}

/// `GET` one chunk on an open session and check it is the chunk we asked for
async fn request_chunk(
    channel: &mut SecureChannel<TcpStream>,
    metadata: &FileMetadata,
    index: u32,
) -> Result<Vec<u8>> {
    let expected_len = metadata.chunk_len(index).ok_or(Error::InvalidChunkIndex {
        index,
        total: metadata.chunk_count,
    })?;

    let response = channel
        .request(&Request::Get {
            filename: metadata.filename.clone(),
            index,
        })
        .await?;

    match response {
        Response::Chunk { index: got, data } => {
            if got != index {
                return Err(Error::ProtocolViolation(format!(
                    "asked for chunk {}, got {}",
                    index, got
                )));
            }
            if data.len() as u64 != expected_len {
                return Err(Error::ProtocolViolation(format!(
                    "chunk {} is {} bytes, expected {}",
                    index,
                    data.len(),
                    expected_len
                )));
            }
            Ok(data)
        }
        Response::Error(reason) => Err(Error::NotFound(reason)),
        Response::Meta(_) => Err(Error::ProtocolViolation(
            "META in reply to GET".to_string(),
        )),
    }
}

/// Send the advisory DONE; failures only matter to the log
async fn close(channel: SecureChannel<TcpStream>) {
    if let Err(e) = channel.finish().await {
        tracing::debug!("Failed to close session cleanly: {}", e);
    }
}

fn short(peer_id: &str) -> &str {
    peer_id.get(..8).unwrap_or(peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(chunk_count: u32) -> FileMetadata {
        FileMetadata {
            filename: "movie.mkv".to_string(),
            size: chunk_count as u64 * 10,
            chunk_size: 10,
            chunk_count,
            content_hash: [1u8; 32],
        }
    }

    #[test]
    fn test_download_job() {
        let mut job = DownloadJob::new(&metadata(5));
        assert!(!job.is_complete());
        assert_eq!(job.missing_chunks(), vec![0, 1, 2, 3, 4]);

        job.record(0, vec![1, 2, 3]);
        job.record(2, vec![4, 5, 6]);

        assert!(!job.is_complete());
        assert_eq!(job.missing_chunks(), vec![1, 3, 4]);
        assert!((job.progress() - 40.0).abs() < 0.1);

        job.record(1, vec![7]);
        job.record(3, vec![8]);
        job.record(4, vec![9]);

        assert!(job.is_complete());
        assert!((job.progress() - 100.0).abs() < 0.1);
    }

    #[test]
    fn test_empty_file_job_is_complete() {
        let job = DownloadJob::new(&metadata(0));
        assert!(job.is_complete());
        assert!(job.missing_chunks().is_empty());
    }

    #[tokio::test]
    async fn test_download_rejects_path_like_filenames() {
        let identity = Arc::new(Identity::generate().unwrap());
        let client = PeerClient::new(identity, TransportConfig::default());
        let temp_dir = tempfile::TempDir::new().unwrap();
        let peer = PeerEndpoint::new("127.0.0.1", 1);

        for name in ["../escape.txt", "a/b.txt", ""] {
            assert!(matches!(
                client.download(&peer, name, temp_dir.path()).await,
                Err(Error::NotFound(_))
            ));
        }
    }

    #[test]
    fn test_concurrency_floor() {
        let identity = Arc::new(Identity::generate().unwrap());
        let client = PeerClient::new(identity, TransportConfig::default()).with_concurrency(0);
        assert_eq!(client.concurrency, 1);
    }
}
