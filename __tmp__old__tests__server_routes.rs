//! Router-level tests: health endpoint and workspace-key routing, exercised
//! with `tower::ServiceExt::oneshot` the way axum apps in this codebase are
//! tested without binding a real socket.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;

use termbroker::server::{build_router, FixedSpawnResolver, ServerState};
use termbroker::{Config, SessionManager};

fn test_state() -> Arc<ServerState> {
    let config = Config::default();
    let manager = SessionManager::new(config.buffer_bytes, Duration::from_secs(config.child_grace_seconds));
    Arc::new(ServerState {
        manager,
        config,
        resolver: Arc::new(FixedSpawnResolver {
            command: "/bin/sh".to_string(),
            args: Vec::new(),
            working_dir: PathBuf::from(std::env::temp_dir()),
        }),
        start_time: Instant::now(),
        checkpoint_marker: None,
        resume_marker_prefix: None,
    })
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let app = build_router(test_state());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let app = build_router(test_state());
    let response = app
        .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn terminal_route_without_upgrade_headers_is_rejected() {
    let app = build_router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/ws/my-workspace/terminal")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::OK);
}


