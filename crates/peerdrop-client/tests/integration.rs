//! Integration tests for the peerdrop client
//!
//! These run real peers and a real registry on ephemeral localhost ports.

use peerdrop_client::config::SessionMode;
use peerdrop_client::discovery::RegistryClient;
use peerdrop_client::downloader::PeerClient;
use peerdrop_client::server::{ChunkStore, PeerServer};
use peerdrop_core::proto::{Request, Response};
use peerdrop_core::{
    chunk, Error, Identity, PeerEndpoint, RegisterRequest, SecureChannel, TransportConfig,
    CHUNK_SIZE,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

fn identity() -> Arc<Identity> {
    static IDENTITY: OnceLock<Arc<Identity>> = OnceLock::new();
    IDENTITY
        .get_or_init(|| Arc::new(Identity::generate().unwrap()))
        .clone()
}

fn client() -> PeerClient {
    PeerClient::new(identity(), TransportConfig::default())
}

fn write_file(dir: &Path, name: &str, size: usize) -> PathBuf {
    let data: Vec<u8> = (0..size).map(|i| (i * 7 % 251) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

async fn start_peer(shared: &Path, chunk_size: usize) -> PeerEndpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = PeerServer::new(
        ChunkStore::new(shared.to_path_buf(), chunk_size).unwrap(),
        TransportConfig::default(),
    );
    tokio::spawn(async move { server.run(listener).await });
    PeerEndpoint::new("127.0.0.1", port)
}

/// A port with nothing listening on it
async fn dead_endpoint() -> PeerEndpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    PeerEndpoint::new("127.0.0.1", port)
}

/// How a misbehaving peer deviates from the real server
#[derive(Clone, Copy, Debug)]
enum Fault {
    /// Hang up instead of answering `GET` for this index
    DropChunk(u32),
    /// Advertise a content hash that does not match the file
    WrongHash,
    /// Answer `GET` for this index with the next index
    WrongIndex(u32),
    /// Answer `GET` for this index with one byte missing
    Truncate(u32),
    /// Describe a different file in the `META` reply
    RenamedMeta,
}

/// Speaks the real protocol over `path`, with a fault injected
async fn start_faulty_peer(path: PathBuf, chunk_size: usize, fault: Fault) -> PeerEndpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let path = path.clone();
            tokio::spawn(async move {
                let mut channel = SecureChannel::accept(stream, &TransportConfig::default())
                    .await
                    .unwrap();
                while let Ok(Some(request)) = channel.recv_request().await {
                    let response = match (request, fault) {
                        (Request::Done, _) => return,
                        (Request::Meta { .. }, _) => {
                            let mut meta = chunk::file_metadata(&path, chunk_size).unwrap();
                            match fault {
                                Fault::WrongHash => meta.content_hash[0] ^= 0xff,
                                Fault::RenamedMeta => meta.filename = "decoy.bin".to_string(),
                                _ => {}
                            }
                            Response::Meta(meta)
                        }
                        (Request::Get { index, .. }, Fault::DropChunk(i)) if index == i => return,
                        (Request::Get { index, .. }, fault) => {
                            let mut data = chunk::read_chunk(&path, index, chunk_size).unwrap();
                            let index = match fault {
                                Fault::WrongIndex(i) if index == i => index + 1,
                                Fault::Truncate(i) if index == i => {
                                    data.pop();
                                    index
                                }
                                _ => index,
                            };
                            Response::Chunk { index, data }
                        }
                    };
                    channel.send_response(&response).await.unwrap();
                }
            });
        }
    });

    PeerEndpoint::new("127.0.0.1", port)
}

async fn start_registry(ttl: Duration) -> RegistryClient {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let registry = Arc::new(peerdrop_registry::Registry::new(ttl));
    tokio::spawn(peerdrop_registry::serve(
        listener,
        registry,
        std::future::pending(),
    ));
    RegistryClient::new(&url).unwrap()
}

fn registration(peer_id: &str, endpoint: &PeerEndpoint, files: &[&str]) -> RegisterRequest {
    RegisterRequest {
        peer_id: peer_id.to_string(),
        public_key: "-----BEGIN PUBLIC KEY-----".to_string(),
        port: endpoint.port,
        files: files.iter().map(|s| s.to_string()).collect(),
        ip: Some(endpoint.ip.clone()),
    }
}

#[tokio::test]
async fn test_download_multi_chunk_file() {
    let shared = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let original = write_file(shared.path(), "big.bin", 2_500_000);
    let peer = start_peer(shared.path(), CHUNK_SIZE).await;

    let meta = client().fetch_metadata(&peer, "big.bin").await.unwrap();
    assert_eq!(meta.chunk_count, 3);
    assert_eq!(meta.chunk_size, CHUNK_SIZE as u64);

    let path = client()
        .with_concurrency(4)
        .download(&peer, "big.bin", output.path())
        .await
        .unwrap();

    assert_eq!(path, output.path().join("big.bin"));
    assert_eq!(std::fs::read(&path).unwrap(), std::fs::read(&original).unwrap());
    let downloaded = chunk::file_metadata(&path, CHUNK_SIZE).unwrap();
    assert_eq!(downloaded.content_hash, meta.content_hash);
}

#[tokio::test]
async fn test_pooled_sessions_download() {
    let shared = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let original = write_file(shared.path(), "pooled.bin", 9_500);
    let peer = start_peer(shared.path(), 1_000).await;

    let path = client()
        .with_concurrency(3)
        .with_session_mode(SessionMode::Pooled)
        .download(&peer, "pooled.bin", output.path())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), std::fs::read(&original).unwrap());
}

#[tokio::test]
async fn test_empty_file_download() {
    let shared = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_file(shared.path(), "empty.txt", 0);
    let peer = start_peer(shared.path(), CHUNK_SIZE).await;

    let path = client().download(&peer, "empty.txt", output.path()).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"");
}

#[tokio::test]
async fn test_missing_file_is_not_found() {
    let shared = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let peer = start_peer(shared.path(), CHUNK_SIZE).await;

    match client().download(&peer, "ghost.txt", output.path()).await {
        Err(Error::NotFound(reason)) => assert!(reason.contains("ghost.txt"), "{}", reason),
        other => panic!("expected NotFound, got {:?}", other),
    }
    assert!(!output.path().join("ghost.txt").exists());
}

#[tokio::test]
async fn test_failed_chunk_fails_download_without_output() {
    let shared = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let source = write_file(shared.path(), "flaky.bin", 2_500);
    let peer = start_faulty_peer(source, 1_000, Fault::DropChunk(1)).await;

    for mode in [SessionMode::PerRequest, SessionMode::Pooled] {
        let result = client()
            .with_session_mode(mode)
            .download(&peer, "flaky.bin", output.path())
            .await;

        match result {
            Err(Error::ChunksFailed { failed, total }) => {
                assert!(failed.contains(&1), "{:?}: {:?}", mode, failed);
                assert_eq!(total, 3);
            }
            other => panic!("{:?}: expected ChunksFailed, got {:?}", mode, other),
        }
        assert!(!output.path().join("flaky.bin").exists());
    }
}

#[tokio::test]
async fn test_mismatched_chunk_replies_fail_download() {
    let shared = TempDir::new().unwrap();
    let source = write_file(shared.path(), "odd.bin", 2_500);

    for fault in [Fault::WrongIndex(1), Fault::Truncate(1)] {
        let peer = start_faulty_peer(source.clone(), 1_000, fault).await;

        for mode in [SessionMode::PerRequest, SessionMode::Pooled] {
            let output = TempDir::new().unwrap();
            let result = client()
                .with_session_mode(mode)
                .download(&peer, "odd.bin", output.path())
                .await;

            match result {
                Err(Error::ChunksFailed { failed, total }) => {
                    assert!(failed.contains(&1), "{:?} {:?}: {:?}", fault, mode, failed);
                    assert_eq!(total, 3);
                }
                other => panic!("{:?} {:?}: expected ChunksFailed, got {:?}", fault, mode, other),
            }
            assert!(!output.path().join("odd.bin").exists());
        }
    }
}

#[tokio::test]
async fn test_metadata_for_another_file_is_rejected() {
    let shared = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let source = write_file(shared.path(), "wanted.bin", 2_500);
    let peer = start_faulty_peer(source, 1_000, Fault::RenamedMeta).await;

    assert!(matches!(
        client().fetch_metadata(&peer, "wanted.bin").await,
        Err(Error::ProtocolViolation(_))
    ));
    assert!(client().download(&peer, "wanted.bin", output.path()).await.is_err());
    assert!(!output.path().join("wanted.bin").exists());
    assert!(!output.path().join("decoy.bin").exists());
}

#[tokio::test]
async fn test_hash_mismatch_keeps_file() {
    let shared = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let source = write_file(shared.path(), "liar.bin", 2_500);
    let peer = start_faulty_peer(source.clone(), 1_000, Fault::WrongHash).await;

    match client().download(&peer, "liar.bin", output.path()).await {
        Err(Error::IntegrityMismatch {
            expected,
            actual,
            path,
        }) => {
            assert_ne!(expected, actual);
            assert_eq!(path, output.path().join("liar.bin"));
            assert_eq!(std::fs::read(&path).unwrap(), std::fs::read(&source).unwrap());
        }
        other => panic!("expected IntegrityMismatch, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_peer_fails_fast() {
    let output = TempDir::new().unwrap();
    let peer = dead_endpoint().await;
    assert!(client().download(&peer, "a.txt", output.path()).await.is_err());
}

#[tokio::test]
async fn test_download_via_discovery_skips_dead_peer() {
    let shared = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let original = write_file(shared.path(), "shared.bin", 3_000);
    let live = start_peer(shared.path(), 1_000).await;
    let dead = dead_endpoint().await;
    let registry = start_registry(Duration::from_secs(60)).await;

    registry
        .register(&registration("live-peer", &live, &["shared.bin"]))
        .await
        .unwrap();
    // Registered last, so offered first
    tokio::time::sleep(Duration::from_millis(10)).await;
    registry
        .register(&registration("dead-peer", &dead, &["shared.bin", "other.bin"]))
        .await
        .unwrap();

    let candidates = registry.find_peers("shared.bin").await.unwrap();
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].peer_id, "dead-peer");

    let path = client()
        .download_via_discovery(&registry, "shared.bin", output.path())
        .await
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), std::fs::read(&original).unwrap());

    match client()
        .download_via_discovery(&registry, "other.bin", output.path())
        .await
    {
        Err(Error::AllPeersFailed { filename, attempts }) => {
            assert_eq!(filename, "other.bin");
            assert_eq!(attempts, 1);
        }
        other => panic!("expected AllPeersFailed, got {:?}", other),
    }

    assert!(matches!(
        client()
            .download_via_discovery(&registry, "nobody-has-this.bin", output.path())
            .await,
        Err(Error::RegistryMiss(_))
    ));
}

#[tokio::test]
async fn test_keep_alive_reregisters_after_eviction() {
    let registry = start_registry(Duration::from_millis(200)).await;
    let endpoint = PeerEndpoint::new("10.1.2.3", 9000);
    let announce = registration("sleepy-peer", &endpoint, &["a.txt"]);

    assert_eq!(registry.register(&announce).await.unwrap(), "10.1.2.3");
    assert!(!registry.keep_alive(&announce).await.unwrap());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(registry.peers(None).await.unwrap().is_empty());
    assert!(matches!(
        registry.heartbeat("sleepy-peer").await,
        Err(Error::RegistryMiss(_))
    ));

    assert!(registry.keep_alive(&announce).await.unwrap());
    let peers = registry.peers(Some("a.txt")).await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].endpoint(), endpoint);
}
