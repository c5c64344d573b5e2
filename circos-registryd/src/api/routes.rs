use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use shared::protocol::API_PREFIX;
use shared::types::{Announcement, Entry, ShutdownNotice};
use crate::push::PushHandler;
use crate::reconcile::Reconciler;
use crate::registration::{validate_address, RegistrationError};
use crate::store::EntryMap;
use crate::store_manager::StoreHandle;
use crate::wol;

#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
    pub reconciler: Arc<Reconciler>,
    pub push: Arc<PushHandler>,
    pub hash_rx: watch::Receiver<String>,
    pub default_port: u16,
    pub wol_broadcast: SocketAddr,
}

#[derive(Deserialize)]
pub struct WakeRequest {
    pub mac: String,
}

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub success: bool,
    pub known: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&format!("{API_PREFIX}/cache"), get(get_cache).post(register))
        .route(&format!("{API_PREFIX}/cache/hash"), get(get_hash))
        .route(&format!("{API_PREFIX}/cache/:address"), get(get_entry))
        .route(&format!("{API_PREFIX}/refresh"), post(refresh))
        .route(&format!("{API_PREFIX}/notify/startup"), post(notify_startup))
        .route(&format!("{API_PREFIX}/notify/shutdown"), post(notify_shutdown))
        .route(&format!("{API_PREFIX}/wol"), post(wake))
        .with_state(state)
}

fn bad_request(message: impl ToString) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message.to_string() }))).into_response()
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> Response {
    tracing::error!("{}: {}", context, e);
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

impl IntoResponse for RegistrationError {
    fn into_response(self) -> Response {
        match self {
            RegistrationError::Store(e) => internal_error("Registry unavailable", format!("{:#}", e)),
            other => bad_request(other),
        }
    }
}

async fn get_cache(State(state): State<AppState>) -> Result<Json<EntryMap>, Response> {
    state
        .store
        .get_all()
        .await
        .map(Json)
        .map_err(|e| internal_error("Failed to read registry", e))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_entry(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Entry>, Response> {
    state
        .store
        .get(address)
        .await
        .map_err(|e| internal_error("Failed to read registry", e))?
        .map(Json)
        .ok_or_else(|| StatusCode::NOT_FOUND.into_response())
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<Announcement>,
) -> Result<Json<serde_json::Value>, RegistrationError> {
    let address = validate_address(&request.address)?;
    let port = request.port.unwrap_or(state.default_port);

    state.store.upsert(address, request.name, port, false).await?;
    Ok(Json(json!({ "success": true })))
}

/// Runs a pass to completion before answering.
async fn refresh(State(state): State<AppState>) -> Result<Json<EntryMap>, Response> {
    let summary = state.reconciler.run_pass().await;
    tracing::info!("Manual refresh: {} visited, {} reaped", summary.visited, summary.reaped);
    get_cache(State(state)).await
}

async fn notify_startup(
    State(state): State<AppState>,
    Json(announcement): Json<Announcement>,
) -> Result<Json<EntryMap>, RegistrationError> {
    state.push.notify_startup(announcement).await.map(Json)
}

async fn notify_shutdown(
    State(state): State<AppState>,
    Json(notice): Json<ShutdownNotice>,
) -> Result<Json<ShutdownResponse>, RegistrationError> {
    let known = state.push.notify_shutdown(notice).await?;
    Ok(Json(ShutdownResponse { success: true, known }))
}

async fn wake(State(state): State<AppState>, Json(request): Json<WakeRequest>) -> Response {
    if let Err(e) = wol::parse_mac(&request.mac) {
        return bad_request(format!("{:#}", e));
    }
    match wol::send_magic_packet(&request.mac, state.wol_broadcast).await {
        Ok(()) => Json(json!({ "status": "sent" })).into_response(),
        Err(e) => internal_error("Wake-on-LAN failed", format!("{:#}", e)),
    }
}
