//! Management API
//!
//! Small axum server over the tunnel's control surface: proxy snapshots,
//! group delay probes, fake-IP flushing and the Prometheus exposition.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::metrics::{init_metrics, REGISTRY};
use super::tunnel::Tunnel;

/// Collaborator port for the DNS fake-IP table; flushing is idempotent.
pub trait FakeIpResolver: Send + Sync {
    fn flush_fake_ip(&self) -> crate::error::Result<()>;
}

/// Default resolver with nothing to flush
pub struct NoopResolver;

impl FakeIpResolver for NoopResolver {
    fn flush_fake_ip(&self) -> crate::error::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
struct ApiState {
    tunnel: Arc<Tunnel>,
    resolver: Arc<dyn FakeIpResolver>,
}

/// Build the management router.
pub fn build_router(tunnel: Arc<Tunnel>, resolver: Arc<dyn FakeIpResolver>) -> Router {
    init_metrics();
    let state = ApiState { tunnel, resolver };
    Router::new()
        .route("/proxies", get(get_proxies))
        .route("/group/:name/delay", get(get_group_delay))
        .route("/cache/fakeip/flush", post(flush_fake_ip))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

/// Serve the management API until the shutdown signal fires.
pub async fn start_api_server(
    addr: SocketAddr,
    tunnel: Arc<Tunnel>,
    resolver: Arc<dyn FakeIpResolver>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let app = build_router(tunnel, resolver);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("failed to bind management API to {}: {}", addr, e);
            return;
        }
    };
    info!("management API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("management API shutting down");
        })
        .await
        .unwrap_or_else(|e| {
            warn!("management API error: {}", e);
        });
}

async fn get_proxies(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({ "proxies": state.tunnel.proxies() }))
}

async fn get_group_delay(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let url = match params.get("url") {
        Some(url) if !url.is_empty() => url.clone(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"message": "missing url"})),
            )
                .into_response()
        }
    };
    let timeout_ms: u64 = match params.get("timeout").map(|t| t.parse()) {
        Some(Ok(ms)) => ms,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"message": "invalid timeout"})),
            )
                .into_response()
        }
    };

    let group = match state.tunnel.registry().group(&name) {
        Some(group) => group,
        None => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"message": "group not found"})),
            )
                .into_response()
        }
    };

    match group
        .url_test(&url, Duration::from_millis(timeout_ms))
        .await
    {
        Ok(delays) => Json(delays).into_response(),
        Err(e) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({"message": e.to_string()})),
        )
            .into_response(),
    }
}

async fn flush_fake_ip(State(state): State<ApiState>) -> impl IntoResponse {
    match state.resolver.flush_fake_ip() {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": e.to_string()})),
        )
            .into_response(),
    }
}

async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or(());

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}
