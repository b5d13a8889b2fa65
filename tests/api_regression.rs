//! API regression tests.
//!
//! In-process tests that build the Axum app via `create_app()` and exercise
//! the HTTP surface using `tower::ServiceExt::oneshot()`. No binary spawn, no
//! network port — runs in CI without `#[ignore]`.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use tower::ServiceExt;

use sentrymesh::ai_client::AiClient;
use sentrymesh::api::{create_app, AppState};
use sentrymesh::baseline::BaselineManager;
use sentrymesh::broadcaster::Broadcaster;
use sentrymesh::geolocator::Geolocator;
use sentrymesh::identity::Identity;
use sentrymesh::pipeline::{PipelineManager, Services};
use sentrymesh::storage::{MemoryRing, Storage, ThreatLog};

fn test_state() -> AppState {
    let identity = Arc::new(Identity::new(None, "admin@example.com".to_string(), "tracel_anon_id".to_string()));
    let storage = Arc::new(Storage::new(None, MemoryRing::new(100), ThreatLog::in_memory()));
    let ai_client = Arc::new(AiClient::new("http://127.0.0.1:1".to_string(), Duration::from_millis(200)));
    let broadcaster = Arc::new(Broadcaster::new(256));
    let baseline = Arc::new(BaselineManager::new(200, 30, 3.0));
    let services = Arc::new(Services {
        geolocator: Arc::new(Geolocator::empty()),
        ai_client: ai_client.clone(),
        baseline,
        broadcaster: broadcaster.clone(),
        storage: storage.clone(),
        process_start_time: Utc::now(),
        owner_idle_timeout: Duration::from_secs(30),
    });
    let pipeline = Arc::new(PipelineManager::new(services));

    AppState { identity, storage, pipeline, broadcaster, ai_client, contacts: Arc::new(RwLock::new(Vec::new())) }
}

fn app() -> axum::Router {
    create_app(test_state(), &[])
}

#[tokio::test]
async fn health_and_status_return_200() {
    for endpoint in ["/health", "/api/status", "/api/session"] {
        let resp = app()
            .oneshot(Request::builder().uri(endpoint).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "endpoint {endpoint} should return 200");
    }
}

#[tokio::test]
async fn session_sets_anon_cookie_when_absent() {
    let resp = app()
        .oneshot(Request::builder().uri("/api/session").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get(axum::http::header::SET_COOKIE).is_some());
}

#[tokio::test]
async fn packets_list_is_ok_envelope() {
    let resp = app()
        .oneshot(Request::builder().uri("/api/packets?limit=10").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["ok"], true);
}

#[tokio::test]
async fn negative_packets_limit_is_bad_request() {
    let resp = app()
        .oneshot(Request::builder().uri("/api/packets?limit=-1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_endpoints_require_admin_without_identity_header() {
    let requests = [
        ("GET", "/api/contact", "{}"),
        ("POST", "/api/admin/reset-mongo", r#"{"confirm":"RESET"}"#),
    ];
    for (method, uri, body) in requests {
        let resp = app()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{method} {uri} should require a bearer token");
    }
}

#[tokio::test]
async fn submit_contact_rejects_empty_fields() {
    let resp = app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/contact")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name":"","email":"","message":""}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn threat_intel_and_timeline_return_ok_envelope() {
    for endpoint in ["/api/threat-intel", "/api/incidents/timeline?from=account&bucket=auto"] {
        let resp = app()
            .oneshot(Request::builder().uri(endpoint).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "endpoint {endpoint} should return 200");

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["ok"], true);
    }
}

#[tokio::test]
async fn incidents_timeline_rejects_unknown_bucket() {
    let resp = app()
        .oneshot(
            Request::builder()
                .uri("/api/incidents/timeline?from=account&bucket=fortnight")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let resp = app()
        .oneshot(Request::builder().uri("/api/does-not-exist").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
