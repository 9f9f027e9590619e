//! HTTP surface: WebSocket upgrade, liveness, ICE config, admin REST.
//!
//! The admin endpoints are a thin shell over the queue, pair and abuse
//! components — no logic of their own. They are gated by a shared secret
//! header and disappear entirely (404) when no secret is configured.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::abuse::ReportRecord;
use crate::config::ServerConfig;
use crate::connection;
use crate::server::SharedState;

const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

/// Build the axum router.
pub fn router(state: Arc<SharedState>) -> Router {
    let cors = if state.config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .route("/ice", get(ice))
        .route("/admin/stats", get(admin_stats))
        .route("/admin/reports", get(admin_reports))
        .route("/admin/bans", get(admin_bans))
        .route("/admin/ban", post(admin_ban))
        .route("/admin/unban", post(admin_unban))
        .route("/admin/clear-reports", post(admin_clear_reports))
        .layer(cors)
        .with_state(state)
}

// ── Client transport ───────────────────────────────────────────────────

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<SharedState>>,
) -> Response {
    let ip = addr.ip();
    if !state.abuse.admission_allowed(ip) {
        tracing::info!(%ip, "Rejected banned IP at admission");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| connection::handle_socket(socket, ip, state))
        .into_response()
}

// ── Liveness ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    store: &'static str,
    uptime_secs: u64,
    connections: usize,
}

async fn healthz(State(state): State<Arc<SharedState>>) -> Response {
    let store_ok = state.store.ping().await.is_ok();
    let body = HealthResponse {
        status: if store_ok { "ok" } else { "degraded" },
        store: if store_ok { "ok" } else { "down" },
        uptime_secs: state.started_at.elapsed().as_secs(),
        connections: state.registry.local_count(),
    };
    let code = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

// ── ICE configuration ──────────────────────────────────────────────────

#[derive(Debug, PartialEq, Serialize)]
struct IceServer {
    urls: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential: Option<String>,
}

#[derive(Serialize)]
struct IceResponse {
    #[serde(rename = "iceServers")]
    ice_servers: Vec<IceServer>,
}

fn ice_servers(config: &ServerConfig) -> Vec<IceServer> {
    let mut servers: Vec<IceServer> = config
        .stun_urls
        .iter()
        .map(|url| IceServer {
            urls: url.clone(),
            username: None,
            credential: None,
        })
        .collect();
    if let (Some(url), Some(username), Some(credential)) = (
        config.turn_url.as_ref(),
        config.turn_username.as_ref(),
        config.turn_credential.as_ref(),
    ) {
        servers.push(IceServer {
            urls: url.clone(),
            username: Some(username.clone()),
            credential: Some(credential.clone()),
        });
    }
    servers
}

async fn ice(State(state): State<Arc<SharedState>>) -> Json<IceResponse> {
    Json(IceResponse {
        ice_servers: ice_servers(&state.config),
    })
}

// ── Admin ──────────────────────────────────────────────────────────────

/// Admin gate. No configured secret means the surface does not exist.
fn authorize(config: &ServerConfig, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(secret) = config.admin_secret.as_deref() else {
        return Err(StatusCode::NOT_FOUND);
    };
    match headers.get(ADMIN_SECRET_HEADER).and_then(|v| v.to_str().ok()) {
        Some(provided) if provided == secret => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn internal_error<E: std::fmt::Display>(e: E) -> StatusCode {
    tracing::error!("Admin operation failed: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

#[derive(Serialize)]
struct StatsResponse {
    waiting: u64,
    pairs: u64,
    local_connections: usize,
    banned_ips: u64,
}

async fn admin_stats(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<StatsResponse>, StatusCode> {
    authorize(&state.config, &headers)?;
    let waiting = state.matchmaker.queue().len().await.map_err(internal_error)?;
    let entries = state
        .matchmaker
        .pairs()
        .entry_count()
        .await
        .map_err(internal_error)?;
    let banned_ips = state.abuse.ban_count().await.map_err(internal_error)?;
    Ok(Json(StatsResponse {
        waiting,
        pairs: entries / 2,
        local_connections: state.registry.local_count(),
        banned_ips,
    }))
}

#[derive(Deserialize)]
struct IpQuery {
    ip: IpAddr,
}

async fn admin_reports(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Query(query): Query<IpQuery>,
) -> Result<Json<Vec<ReportRecord>>, StatusCode> {
    authorize(&state.config, &headers)?;
    let reports = state
        .abuse
        .reports_for(query.ip)
        .await
        .map_err(internal_error)?;
    Ok(Json(reports))
}

#[derive(Serialize)]
struct BanEntry {
    ip: String,
    reason: Option<String>,
    timestamp: Option<String>,
}

async fn admin_bans(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<BanEntry>>, StatusCode> {
    authorize(&state.config, &headers)?;
    let bans = state.abuse.ban_list().await.map_err(internal_error)?;
    Ok(Json(
        bans.into_iter()
            .map(|(ip, details)| BanEntry {
                ip,
                reason: details.get("reason").cloned(),
                timestamp: details.get("timestamp").cloned(),
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
struct BanRequest {
    ip: IpAddr,
    reason: String,
}

async fn admin_ban(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(req): Json<BanRequest>,
) -> Result<StatusCode, StatusCode> {
    authorize(&state.config, &headers)?;
    state
        .abuse
        .ban(req.ip, &req.reason)
        .await
        .map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct IpRequest {
    ip: IpAddr,
}

async fn admin_unban(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(req): Json<IpRequest>,
) -> Result<StatusCode, StatusCode> {
    authorize(&state.config, &headers)?;
    state.abuse.unban(req.ip).await.map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn admin_clear_reports(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(req): Json<IpRequest>,
) -> Result<StatusCode, StatusCode> {
    authorize(&state.config, &headers)?;
    state
        .abuse
        .clear_reports(req.ip)
        .await
        .map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}
