//! Isolation and containment tests: concurrent requests, broken workers.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use futures_util::future::join_all;
use sandboxd::config::{SandboxConfig, ServiceConfig};
use sandboxd::encoder::ExecutionResponse;
use sandboxd::{create_app, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

fn app_with(sandbox: SandboxConfig) -> Router {
    create_app(AppState::new(ServiceConfig::from_sandbox(sandbox)))
}

fn app() -> Router {
    app_with(SandboxConfig::new(env!("CARGO_BIN_EXE_sandboxd")))
}

async fn run(app: Router, program: &str) -> (StatusCode, ExecutionResponse) {
    let request = Request::builder()
        .method("GET")
        .uri(format!("/{}", hex::encode(program)))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body_bytes).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_do_not_share_logs() {
    let app = app();
    let requests = (0..8).map(|i| {
        let app = app.clone();
        async move {
            let program = format!(
                "for (let j = 0; j < 20; j++) console.log('req{i}-' + j); 'done{i}'"
            );
            (i, run(app, &program).await)
        }
    });

    for (i, (status, body)) in join_all(requests).await {
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.result, json!(format!("done{i}")));
        let expected: Vec<String> = (0..20).map(|j| format!("req{i}-{j}")).collect();
        assert_eq!(body.logs, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_globals_do_not_leak_between_requests() {
    let app = app();
    let (_, first) = run(
        app.clone(),
        "globalThis.secret = 'leak'; Object.prototype.polluted = 1; 1",
    )
    .await;
    assert_eq!(first.result, json!(1));

    let (_, second) = run(app, "[typeof secret, typeof ({}).polluted]").await;
    assert_eq!(second.result, json!(["undefined", "undefined"]));
}

#[tokio::test]
async fn test_worker_exiting_without_report_is_contained() {
    let (status, body) = run(app_with(SandboxConfig::new("/bin/true")), "42").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.result, Value::Null);
    assert_eq!(
        body.logs,
        vec!["Error: Sandbox terminated unexpectedly (exit status: 0)"]
    );
}

#[tokio::test]
async fn test_worker_writing_garbage_is_a_protocol_violation() {
    let (status, body) = run(app_with(SandboxConfig::new("/bin/echo")), "42").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.result, Value::Null);
    assert_eq!(body.logs.len(), 1);
    assert!(
        body.logs[0].starts_with("Error: Sandbox protocol violation: malformed frame"),
        "{:?}",
        body.logs
    );
}

#[tokio::test]
async fn test_missing_worker_is_a_server_error() {
    let (status, body) = run(
        app_with(SandboxConfig::new("/nonexistent/sandboxd")),
        "42",
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body.result, Value::Null);
    assert!(
        body.logs[0].starts_with("Error: Sandbox unavailable: failed to spawn worker"),
        "{:?}",
        body.logs
    );
}
