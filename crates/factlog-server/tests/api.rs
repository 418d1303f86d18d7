use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use factlog_db::DbRuntimeSettings;
use factlog_server::{app, AppState};
use factlog_store::FactStore;
use factlog_subscribe::{CoordinatorSettings, SubscriptionCoordinator};
use factlog_types::Fact;
use serde_json::Value;
use tower::ServiceExt;

fn state(dir: &tempfile::TempDir) -> Arc<AppState> {
    let path = dir.path().join("facts.db");
    let store = Arc::new(
        FactStore::open(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap(),
    );
    let coordinator = Arc::new(SubscriptionCoordinator::for_store(
        Arc::clone(&store),
        CoordinatorSettings::default(),
        tokio::runtime::Handle::current(),
    ));
    Arc::new(AppState { store, coordinator })
}

async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, Value) {
    let response = app(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_check_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let (status, json) = get_json(state(&dir), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn serial_endpoint_reports_the_newest_serial() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(&dir);

    let (status, json) = get_json(Arc::clone(&state), "/api/facts/serial").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["serial"], 0);

    state
        .store
        .publish(vec![Fact::new("orders", "placed"), Fact::new("users", "joined")])
        .unwrap();
    let (_, json) = get_json(state, "/api/facts/serial").await;
    assert_eq!(json["serial"], 2);
}
