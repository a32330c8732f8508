//! HTTP client for the discovery registry
//!
//! Registers the local peer, keeps it alive with heartbeats, and looks up
//! peers advertising a file.

use peerdrop_core::{
    Error, PeerSummary, PeersResponse, RegisterRequest, RegisterResponse, Result,
};
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Timeout for every registry request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to one registry over HTTP
#[derive(Clone)]
pub struct RegistryClient {
    http: Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Registry(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Announce this peer and its files; returns the address the registry
    /// recorded
    pub async fn register(&self, registration: &RegisterRequest) -> Result<String> {
        let response = self
            .http
            .post(self.url("register"))
            .json(registration)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Registry(format!("register failed: HTTP {}", status)));
        }
        let body: RegisterResponse = response.json().await.map_err(map_request_error)?;

        tracing::info!(
            "Registered with {} as {} ({} files)",
            self.base_url,
            body.ip,
            registration.files.len()
        );
        Ok(body.ip)
    }

    /// Refresh liveness; an unknown peer is [`Error::RegistryMiss`]
    pub async fn heartbeat(&self, peer_id: &str) -> Result<()> {
        let response = self
            .http
            .get(self.url("heartbeat"))
            .query(&[("peer_id", peer_id)])
            .send()
            .await
            .map_err(map_request_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::RegistryMiss(format!(
                "registry does not know peer {}",
                peer_id
            ))),
            status => Err(Error::Registry(format!("heartbeat failed: HTTP {}", status))),
        }
    }

    /// List live peers, optionally only those sharing `file`
    pub async fn peers(&self, file: Option<&str>) -> Result<Vec<PeerSummary>> {
        let mut request = self.http.get(self.url("peers"));
        if let Some(file) = file {
            request = request.query(&[("file", file)]);
        }

        let response = request.send().await.map_err(map_request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Registry(format!("peer query failed: HTTP {}", status)));
        }
        let body: PeersResponse = response.json().await.map_err(map_request_error)?;
        Ok(body.peers)
    }

    /// Peers sharing `filename`; none is [`Error::RegistryMiss`]
    pub async fn find_peers(&self, filename: &str) -> Result<Vec<PeerSummary>> {
        let peers = self.peers(Some(filename)).await?;
        if peers.is_empty() {
            return Err(Error::RegistryMiss(format!("no peers share {}", filename)));
        }
        tracing::debug!("{} peers share {}", peers.len(), filename);
        Ok(peers)
    }

    /// Heartbeat once, re-registering if the registry has forgotten us.
    /// Returns whether a re-registration happened.
    pub async fn keep_alive(&self, registration: &RegisterRequest) -> Result<bool> {
        match self.heartbeat(&registration.peer_id).await {
            Ok(()) => Ok(false),
            Err(Error::RegistryMiss(_)) => {
                tracing::info!("Registry forgot us, re-registering");
                self.register(registration).await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}

fn map_request_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Registry(format!("request timed out: {}", e))
    } else {
        Error::Registry(e.to_string())
    }
}

/// Heartbeat every `interval` forever
pub async fn heartbeat_loop(
    registry: RegistryClient,
    registration: RegisterRequest,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match registry.keep_alive(&registration).await {
            Ok(_) => tracing::debug!("Heartbeat sent to {}", registry.base_url()),
            Err(e) => tracing::warn!("Heartbeat to {} failed: {}", registry.base_url(), e),
        }
    }
}
