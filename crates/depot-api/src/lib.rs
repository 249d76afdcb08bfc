//! depot-api: control surface for the orchestrator.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/worker` | List versions |
//! | POST | `/worker/add` | Register a version |
//! | POST | `/worker/status/{status}` | Overwrite a version's status |
//! | POST | `/worker/recycle` | Recycle the gateway for a prefix |
//! | POST | `/worker/docker` | Render a manual import command |
//! | GET | `/mapping` | List prefix mappings |
//! | POST | `/mapping/set` | Map a prefix to a version |
//! | POST | `/mapping/delete` | Unmap a prefix and stop its gateway |
//! | GET | `/config` | Read the remote override config |
//! | POST | `/config` | Store the remote override config |
//! | POST | `/orchestrator/kill` | Acknowledge, then shut down |
//! | GET | `/ping` | Liveness |
//!
//! Failures answer 500 with `{"error": ...}`.

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use depot_state::KeyValueStore;
use depot_versions::VersionManager;
use tokio::sync::watch;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub versions: Arc<VersionManager>,
    pub meta: Arc<dyn KeyValueStore>,
    /// Set to `true` by `/orchestrator/kill`.
    pub shutdown: Arc<watch::Sender<bool>>,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/worker", get(handlers::list_workers))
        .route("/worker/add", post(handlers::add_worker))
        .route("/worker/status/{status}", post(handlers::set_worker_status))
        .route("/worker/recycle", post(handlers::recycle_worker))
        .route("/worker/docker", post(handlers::docker_command))
        .route("/mapping", get(handlers::list_mappings))
        .route("/mapping/set", post(handlers::set_mapping))
        .route("/mapping/delete", post(handlers::delete_mapping))
        .route("/config", get(handlers::get_config).post(handlers::set_config))
        .route("/orchestrator/kill", post(handlers::kill))
        .route("/ping", get(handlers::ping))
        .with_state(state)
}
