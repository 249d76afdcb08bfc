//! Control API tests.
//!
//! Drives the router in-process against in-memory tables and a recording
//! gateway.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use depot_api::{ApiState, build_router};
use depot_core::{DbTemplate, OrchestratorConfig};
use depot_state::Tables;
use depot_versions::VersionManager;
use depot_versions::testing::{FakeDatabaseAdmin, GatewayCall, RecordingGateway};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio::sync::watch;
use tower::ServiceExt;

struct Fixture {
    router: Router,
    gateway: Arc<RecordingGateway>,
    shutdown: watch::Receiver<bool>,
}

fn fixture() -> Fixture {
    let mut config = OrchestratorConfig::default();
    config.db.insert(
        "local".into(),
        DbTemplate {
            server: "localhost".into(),
            user: "depot".into(),
            password: "pw".into(),
        },
    );
    let tables = Tables::in_memory().unwrap();
    let gateway = Arc::new(RecordingGateway::default());
    let versions = Arc::new(VersionManager::new(
        Arc::new(config),
        &tables,
        gateway.clone(),
        Arc::new(FakeDatabaseAdmin::default()),
    ));
    let (tx, rx) = watch::channel(false);
    let router = build_router(ApiState {
        versions,
        meta: tables.meta.clone(),
        shutdown: Arc::new(tx),
    });
    Fixture {
        router,
        gateway,
        shutdown: rx,
    }
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(router, req).await
}

async fn post(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    send(router, req).await
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn add_version(router: &Router) -> String {
    let (status, body) = post(
        router,
        "/worker/add",
        json!({
            "prefix": "nz-akl",
            "version": "2024-01-01_v1",
            "shapesContainer": "shapes",
            "shapesRegion": "ap-southeast-2",
            "dbconfig": "local",
            "newRealtime": true
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].is_string());
    "nz_akl_2024_01_01_v1".to_string()
}

#[tokio::test]
async fn ping() {
    let f = fixture();
    let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
    let resp = f.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"pong");
}

#[tokio::test]
async fn add_and_list_workers() {
    let f = fixture();
    let id = add_version(&f.router).await;

    let (status, body) = get(&f.router, "/worker").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([{
            "id": id,
            "prefix": "nz-akl",
            "status": "empty",
            "version": "2024-01-01_v1",
            "dbname": id,
        }])
    );
}

#[tokio::test]
async fn unknown_db_template_is_an_error() {
    let f = fixture();
    let (status, body) = post(
        &f.router,
        "/worker/add",
        json!({ "prefix": "nz-akl", "version": "v1", "dbconfig": "nowhere" }),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("nowhere"));

    let (_, body) = get(&f.router, "/worker").await;
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn status_updates() {
    let f = fixture();
    let id = add_version(&f.router).await;

    let (status, _) = post(&f.router, "/worker/status/pendingimport-willmap", json!({ "id": id })).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = get(&f.router, "/worker").await;
    assert_eq!(body[0]["status"], "pendingimport-willmap");

    let (status, body) = post(&f.router, "/worker/status/finished", json!({ "id": id })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("finished"));

    let (status, _) = post(&f.router, "/worker/status/imported", json!({ "id": "missing" })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn mapping_lifecycle() {
    let f = fixture();
    let id = add_version(&f.router).await;

    let (status, _) = post(&f.router, "/mapping/set", json!({ "prefix": "nz-akl", "id": id })).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = get(&f.router, "/mapping").await;
    assert_eq!(body, json!({ "nz-akl": { "value": id } }));
    assert_eq!(f.gateway.starts_for("nz-akl"), 1);

    let (status, _) = post(&f.router, "/worker/recycle", json!({ "prefix": "nz-akl" })).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = post(&f.router, "/mapping/delete", json!({ "prefix": "nz-akl" })).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = get(&f.router, "/mapping").await;
    assert_eq!(body, json!({}));

    assert_eq!(
        f.gateway.calls(),
        vec![
            GatewayCall::Start {
                prefix: "nz-akl".into(),
                id: id.clone(),
            },
            GatewayCall::Recycle {
                prefix: "nz-akl".into(),
                id,
            },
            GatewayCall::Stop {
                prefix: "nz-akl".into(),
            },
        ]
    );
}

#[tokio::test]
async fn mapping_to_unknown_version_is_rejected() {
    let f = fixture();
    let (status, body) = post(&f.router, "/mapping/set", json!({ "prefix": "nz-akl", "id": "ghost" })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());

    let (_, body) = get(&f.router, "/mapping").await;
    assert_eq!(body, json!({}));
    assert!(f.gateway.calls().is_empty());
}

#[tokio::test]
async fn recycle_without_mapping_is_a_no_op() {
    let f = fixture();
    let (status, _) = post(&f.router, "/worker/recycle", json!({ "prefix": "nz-wlg" })).await;
    assert_eq!(status, StatusCode::OK);
    assert!(f.gateway.calls().is_empty());
}

#[tokio::test]
async fn docker_command_for_version() {
    let f = fixture();
    let id = add_version(&f.router).await;

    let (status, body) = post(&f.router, "/worker/docker", json!({ "id": id })).await;
    assert_eq!(status, StatusCode::OK);
    let command = body["command"].as_str().unwrap();
    assert!(command.starts_with("docker run "));
    assert!(command.contains("-e \"PREFIX=nz-akl\""));
    assert!(command.contains("-e \"KEYVALUE=local\""));
    assert!(command.ends_with("depot/importer"));

    let (status, _) = post(&f.router, "/worker/docker", json!({ "id": "missing" })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn override_config_round_trip() {
    let f = fixture();
    let (status, body) = get(&f.router, "/config").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "config": {} }));

    let config = json!({ "delete_old_versions": true, "sweep_concurrency": 2 });
    let (status, _) = post(&f.router, "/config", json!({ "config": config })).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = get(&f.router, "/config").await;
    assert_eq!(body, json!({ "config": config }));

    let (status, body) = post(&f.router, "/config", json!({ "config": { "sweep_concurrency": 0 } })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());
    let (_, body) = get(&f.router, "/config").await;
    assert_eq!(body, json!({ "config": config }));
}

#[tokio::test]
async fn kill_acknowledges_then_signals_shutdown() {
    let mut f = fixture();
    let (status, body) = post(&f.router, "/orchestrator/kill", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].is_string());

    f.shutdown.changed().await.unwrap();
    assert!(*f.shutdown.borrow());
}
