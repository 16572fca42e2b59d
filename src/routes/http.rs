// HTTP handlers: version, status, control, session, history and aggregates

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::AppState;
use crate::gateway::PersistError;
use crate::models::{AuthState, HistoryFilter};
use crate::store::RemoteStore;
use crate::version::version_info;

const DEFAULT_WINDOW_HOURS: u32 = 24;
const MAX_WINDOW_HOURS: u32 = 24 * 31;
const MAX_HISTORY_LIMIT: u32 = 10_000;

/// Read-path failure mapped to a status code.
pub(super) struct ApiError(PersistError);

impl From<PersistError> for ApiError {
    fn from(e: PersistError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            PersistError::Unauthenticated => StatusCode::UNAUTHORIZED,
            PersistError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            PersistError::EmptyBatch => StatusCode::BAD_REQUEST,
            PersistError::RejectedByStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "read request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// GET /version: service name and version (from Cargo.toml at build time).
pub(super) async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// GET /api/status: pipeline state, buffer depth and loss counters.
pub(super) async fn status_handler<S: RemoteStore>(
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    let snapshot = state.stats.snapshot(state.control.state(), state.buffer.len());
    let ws_clients = state
        .ws_connections
        .load(std::sync::atomic::Ordering::Relaxed);
    let mut body = serde_json::to_value(&snapshot).unwrap_or_default();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("wsClients".into(), ws_clients.into());
        obj.insert("deviceId".into(), state.device_id.as_ref().into());
    }
    Json(body)
}

/// GET /api/samples/recent: the realtime window, oldest first.
pub(super) async fn recent_handler<S: RemoteStore>(
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    Json(state.recent.to_vec())
}

/// POST /api/flush: forces a flush; reports how many samples were queued.
pub(super) async fn flush_handler<S: RemoteStore>(
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    let queued = state.control.flush_now().await;
    Json(serde_json::json!({ "queued": queued }))
}

/// GET /api/history?deviceId=&start=&end=&limit=: newest first; empty when signed out.
pub(super) async fn history_handler<S: RemoteStore>(
    State(state): State<AppState<S>>,
    Query(mut filter): Query<HistoryFilter>,
) -> Result<impl IntoResponse, ApiError> {
    filter.limit = filter.limit.min(MAX_HISTORY_LIMIT);
    let identity = state.identity();
    let samples = state
        .gateway
        .fetch_history(identity.as_ref(), &filter)
        .await?;
    Ok(Json(samples))
}

#[derive(Debug, Deserialize)]
pub(super) struct WindowQuery {
    hours: Option<u32>,
}

impl WindowQuery {
    fn hours(&self) -> u32 {
        self.hours
            .unwrap_or(DEFAULT_WINDOW_HOURS)
            .clamp(1, MAX_WINDOW_HOURS)
    }
}

/// GET /api/stats/{device_id}?hours=: summary statistics; 404 when the window is empty.
pub(super) async fn stats_handler<S: RemoteStore>(
    State(state): State<AppState<S>>,
    Path(device_id): Path<String>,
    Query(window): Query<WindowQuery>,
) -> Result<Response, ApiError> {
    let identity = state.identity();
    let stats = state
        .gateway
        .fetch_aggregates(identity.as_ref(), &device_id, window.hours())
        .await?;
    Ok(match stats {
        Some(stats) => Json(stats).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no samples in window" })),
        )
            .into_response(),
    })
}

/// GET /api/hourly/{device_id}?hours=: hourly buckets, ascending.
pub(super) async fn hourly_handler<S: RemoteStore>(
    State(state): State<AppState<S>>,
    Path(device_id): Path<String>,
    Query(window): Query<WindowQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = state.identity();
    let buckets = state
        .gateway
        .fetch_hourly(identity.as_ref(), &device_id, window.hours())
        .await?;
    Ok(Json(buckets))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SignIn {
    user_id: String,
}

/// GET /api/session
pub(super) async fn session_get<S: RemoteStore>(
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    Json(state.auth_tx.borrow().clone())
}

/// POST /api/session {"userId": "..."}: signs in (or switches identity).
pub(super) async fn session_sign_in<S: RemoteStore>(
    State(state): State<AppState<S>>,
    Json(body): Json<SignIn>,
) -> Response {
    let user_id = body.user_id.trim();
    if user_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "userId must be non-empty" })),
        )
            .into_response();
    }
    let auth = AuthState::signed_in(user_id);
    tracing::info!(user_id, "session sign-in");
    state.auth_tx.send_replace(auth.clone());
    Json(auth).into_response()
}

/// DELETE /api/session: signs out; the scheduler flushes under the outgoing identity.
pub(super) async fn session_sign_out<S: RemoteStore>(
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    tracing::info!("session sign-out");
    state.auth_tx.send_replace(AuthState::signed_out());
    StatusCode::NO_CONTENT
}
