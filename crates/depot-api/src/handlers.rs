//! Control API handlers.

use std::str::FromStr;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use depot_core::{NewVersion, VersionStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::ApiState;

/// Meta table key of the remote override config.
pub const CONFIG_KEY: &str = "config";

#[derive(Serialize)]
struct Ack {
    message: String,
}

fn ack(message: impl Into<String>) -> Json<Ack> {
    Json(Ack {
        message: message.into(),
    })
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

fn internal(msg: &str) -> axum::response::Response {
    error_response(msg, StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

#[derive(Deserialize)]
pub struct IdRequest {
    pub id: String,
}

#[derive(Deserialize)]
pub struct PrefixRequest {
    pub prefix: String,
}

#[derive(Deserialize)]
pub struct MappingRequest {
    pub prefix: String,
    pub id: String,
}

#[derive(Deserialize)]
pub struct ConfigRequest {
    pub config: Value,
}

// ── Workers ────────────────────────────────────────────────────

/// GET /worker
pub async fn list_workers(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.versions.summaries().await)
}

/// POST /worker/add
pub async fn add_worker(
    State(state): State<ApiState>,
    Json(new): Json<NewVersion>,
) -> impl IntoResponse {
    match state.versions.add_version(&new).await {
        Ok(Some(id)) => ack(format!("added version {id}")).into_response(),
        Ok(None) => internal(&format!("no database config named {}", new.dbconfig)),
        Err(e) => internal(&e.to_string()),
    }
}

/// POST /worker/status/{status}
pub async fn set_worker_status(
    State(state): State<ApiState>,
    Path(status): Path<String>,
    Json(req): Json<IdRequest>,
) -> impl IntoResponse {
    let status = match VersionStatus::from_str(&status) {
        Ok(status) => status,
        Err(e) => {
            warn!(id = %req.id, error = %e, "rejected status update");
            return internal(&e.to_string());
        }
    };
    match state.versions.update_version_status(&req.id, status).await {
        Ok(()) => ack(format!("updated {} to {status}", req.id)).into_response(),
        Err(e) => internal(&e.to_string()),
    }
}

/// POST /worker/recycle
pub async fn recycle_worker(
    State(state): State<ApiState>,
    Json(req): Json<PrefixRequest>,
) -> impl IntoResponse {
    match state.versions.recycle_gateway(&req.prefix).await {
        Ok(()) => ack(format!("recycled {}", req.prefix)).into_response(),
        Err(e) => internal(&e.to_string()),
    }
}

/// POST /worker/docker
pub async fn docker_command(
    State(state): State<ApiState>,
    Json(req): Json<IdRequest>,
) -> impl IntoResponse {
    match state.versions.docker_command(&req.id).await {
        Ok(command) => Json(json!({ "command": command })).into_response(),
        Err(e) => internal(&e.to_string()),
    }
}

// ── Mappings ───────────────────────────────────────────────────

/// GET /mapping
pub async fn list_mappings(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.versions.all_mappings().await)
}

/// POST /mapping/set
pub async fn set_mapping(
    State(state): State<ApiState>,
    Json(req): Json<MappingRequest>,
) -> impl IntoResponse {
    match state.versions.update_mapping(&req.prefix, &req.id).await {
        Ok(()) => ack(format!("mapped {} to {}", req.prefix, req.id)).into_response(),
        Err(e) => internal(&e.to_string()),
    }
}

/// POST /mapping/delete
pub async fn delete_mapping(
    State(state): State<ApiState>,
    Json(req): Json<PrefixRequest>,
) -> impl IntoResponse {
    match state.versions.delete_mapping(&req.prefix).await {
        Ok(()) => ack(format!("unmapped {}", req.prefix)).into_response(),
        Err(e) => internal(&e.to_string()),
    }
}

// ── Config ─────────────────────────────────────────────────────

/// GET /config
pub async fn get_config(State(state): State<ApiState>) -> impl IntoResponse {
    match state.meta.try_get(CONFIG_KEY).await {
        Ok(config) => Json(json!({ "config": config.unwrap_or_else(|| json!({})) })).into_response(),
        Err(e) => internal(&e.to_string()),
    }
}

/// POST /config
///
/// The override is checked against the running config before it is
/// stored. It takes effect on the next start.
pub async fn set_config(
    State(state): State<ApiState>,
    Json(req): Json<ConfigRequest>,
) -> impl IntoResponse {
    if let Err(e) = state.versions.config().merge_remote(&req.config) {
        return internal(&e.to_string());
    }
    match state.meta.try_set(CONFIG_KEY, &req.config).await {
        Ok(()) => {
            info!("stored override config");
            ack("config saved, restart to apply").into_response()
        }
        Err(e) => internal(&e.to_string()),
    }
}

// ── Process ────────────────────────────────────────────────────

/// POST /orchestrator/kill
pub async fn kill(State(state): State<ApiState>) -> impl IntoResponse {
    info!("kill requested, shutting down");
    if state.shutdown.send(true).is_err() {
        warn!("nothing is listening for shutdown");
    }
    ack("shutting down")
}

/// GET /ping
pub async fn ping() -> &'static str {
    "pong"
}
