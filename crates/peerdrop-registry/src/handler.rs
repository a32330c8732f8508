//! HTTP routes for the registry
//!
//! - `POST /register` records a peer, resolving its address
//! - `GET /heartbeat?peer_id=` refreshes liveness, 404 for unknown peers
//! - `GET /peers[?file=]` lists live peers

use crate::directory::Registry;
use axum::{
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use peerdrop_core::{
    ErrorResponse, MessageResponse, PeersResponse, RegisterRequest, RegisterResponse,
};
use serde::Deserialize;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Build the registry router
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/heartbeat", get(heartbeat))
        .route("/peers", get(peers))
        .with_state(registry)
}

/// Serve the registry on `listener` until `shutdown` resolves
pub async fn serve<F>(
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!(
        "Registry listening on {} (ttl {:?})",
        listener.local_addr()?,
        registry.ttl()
    );
    axum::serve(
        listener,
        router(registry).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

/// Pick the address to record for a registering peer.
///
/// A reported address wins unless it is missing, empty or loopback; then the
/// address the request actually came from is used.
pub fn resolve_ip(reported: Option<&str>, observed: IpAddr) -> String {
    match reported.map(str::trim) {
        Some(ip) if !ip.is_empty() && !is_loopback(ip) => ip.to_string(),
        _ => observed.to_canonical().to_string(),
    }
}

fn is_loopback(ip: &str) -> bool {
    if ip.eq_ignore_ascii_case("localhost") {
        return true;
    }
    ip.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

async fn register(
    State(registry): State<Arc<Registry>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    if req.peer_id.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "peer_id is required"));
    }
    if req.port == 0 {
        return Err(api_error(StatusCode::BAD_REQUEST, "port is required"));
    }

    let ip = resolve_ip(req.ip.as_deref(), remote.ip());
    registry.register(&req.peer_id, &ip, req.port, &req.public_key, req.files);

    Ok(Json(RegisterResponse {
        message: "registered".to_string(),
        ip,
    }))
}

#[derive(Debug, Deserialize)]
struct HeartbeatParams {
    peer_id: String,
}

async fn heartbeat(
    State(registry): State<Arc<Registry>>,
    Query(params): Query<HeartbeatParams>,
) -> Result<Json<MessageResponse>, ApiError> {
    match registry.heartbeat(&params.peer_id) {
        Ok(()) => Ok(Json(MessageResponse {
            message: "heartbeat received".to_string(),
        })),
        Err(_) => {
            tracing::debug!("Heartbeat from unknown peer {}", params.peer_id);
            Err(api_error(StatusCode::NOT_FOUND, "peer not found"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct PeersParams {
    file: Option<String>,
}

async fn peers(
    State(registry): State<Arc<Registry>>,
    Query(params): Query<PeersParams>,
) -> Json<PeersResponse> {
    let peers = registry.query(params.file.as_deref());
    tracing::debug!(
        "Peer query {:?}: {} live peers",
        params.file.as_deref().unwrap_or("*"),
        peers.len()
    );
    Json(PeersResponse { peers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_resolve_ip() {
        let observed = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

        assert_eq!(resolve_ip(Some("10.0.0.5"), observed), "10.0.0.5");
        assert_eq!(resolve_ip(None, observed), "192.168.1.20");
        assert_eq!(resolve_ip(Some(""), observed), "192.168.1.20");
        assert_eq!(resolve_ip(Some("127.0.0.1"), observed), "192.168.1.20");
        assert_eq!(resolve_ip(Some("localhost"), observed), "192.168.1.20");
        assert_eq!(resolve_ip(Some("::1"), observed), "192.168.1.20");
    }

    #[test]
    fn test_resolve_ip_unmaps_v4_in_v6() {
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 1, 2, 3).to_ipv6_mapped());
        assert_eq!(resolve_ip(None, mapped), "10.1.2.3");
        assert_eq!(resolve_ip(None, IpAddr::V6(Ipv6Addr::LOCALHOST)), "::1");
    }
}
