// HTTP + WebSocket routes: pipeline status, control, history, live samples

mod http;
mod ws;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::sync::{broadcast, watch};
use tower_http::cors::{Any, CorsLayer};

use crate::buffer::BatchBuffer;
use crate::gateway::PersistenceGateway;
use crate::models::{AuthState, Identity, Sample};
use crate::scheduler::SchedulerControl;
use crate::status::{PipelineStats, RecentSamples};
use crate::store::RemoteStore;

/// Everything the handlers read or drive.
pub struct RouterDeps<S> {
    pub gateway: PersistenceGateway<S>,
    pub control: SchedulerControl,
    pub stats: Arc<PipelineStats>,
    pub buffer: Arc<BatchBuffer>,
    pub recent: Arc<RecentSamples>,
    pub live_tx: broadcast::Sender<Sample>,
    pub auth_tx: Arc<watch::Sender<AuthState>>,
    pub device_id: String,
}

pub(crate) struct AppState<S> {
    pub(crate) gateway: PersistenceGateway<S>,
    pub(crate) control: SchedulerControl,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) buffer: Arc<BatchBuffer>,
    pub(crate) recent: Arc<RecentSamples>,
    pub(crate) live_tx: broadcast::Sender<Sample>,
    pub(crate) auth_tx: Arc<watch::Sender<AuthState>>,
    pub(crate) device_id: Arc<str>,
    pub(crate) ws_connections: Arc<AtomicUsize>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            control: self.control.clone(),
            stats: self.stats.clone(),
            buffer: self.buffer.clone(),
            recent: self.recent.clone(),
            live_tx: self.live_tx.clone(),
            auth_tx: self.auth_tx.clone(),
            device_id: self.device_id.clone(),
            ws_connections: self.ws_connections.clone(),
        }
    }
}

impl<S> AppState<S> {
    /// Identity of the current session, scoped to this device.
    pub(crate) fn identity(&self) -> Option<Identity> {
        self.auth_tx
            .borrow()
            .identity()
            .map(|i| i.with_device(self.device_id.as_ref()))
    }
}

pub fn app<S: RemoteStore>(deps: RouterDeps<S>) -> Router {
    let state = AppState {
        gateway: deps.gateway,
        control: deps.control,
        stats: deps.stats,
        buffer: deps.buffer,
        recent: deps.recent,
        live_tx: deps.live_tx,
        auth_tx: deps.auth_tx,
        device_id: deps.device_id.into(),
        ws_connections: Arc::new(AtomicUsize::new(0)),
    };
    Router::new()
        .route("/version", get(http::version_handler)) // GET /version
        .route("/api/status", get(http::status_handler::<S>)) // GET /api/status
        .route("/api/samples/recent", get(http::recent_handler::<S>)) // GET /api/samples/recent
        .route("/api/flush", post(http::flush_handler::<S>)) // POST /api/flush
        .route("/api/history", get(http::history_handler::<S>)) // GET /api/history
        .route("/api/stats/{device_id}", get(http::stats_handler::<S>)) // GET /api/stats/:device
        .route("/api/hourly/{device_id}", get(http::hourly_handler::<S>)) // GET /api/hourly/:device
        .route(
            "/api/session",
            get(http::session_get::<S>)
                .post(http::session_sign_in::<S>)
                .delete(http::session_sign_out::<S>),
        ) // GET/POST/DELETE /api/session
        .route("/ws/samples", get(ws::ws_samples::<S>)) // WS /ws/samples
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}
