//! Integration tests for the webhook endpoint, driving the router in memory.

#![cfg(unix)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use push_deploy_notifier::error::DeployError;
use push_deploy_notifier::notifier::NotificationSink;
use push_deploy_notifier::signature::{sign_sha1, sign_sha256};
use push_deploy_notifier::{AppState, DeployConfig, build_router};
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "test-webhook-secret";

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn messages(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, text: &str) -> Result<(), DeployError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

struct TestApp {
    root: TempDir,
    sink: Arc<RecordingSink>,
    router: axum::Router,
}

impl TestApp {
    fn new(customize: impl FnOnce(&mut DeployConfig)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut config = DeployConfig {
            projects_root: root.path().to_path_buf(),
            webhook_secret: Some(SECRET.to_string()),
            timezone: "UTC".to_string(),
            ..DeployConfig::default()
        };
        customize(&mut config);
        let state = AppState::new(config, Some(sink.clone()), None).unwrap();
        Self {
            root,
            sink,
            router: build_router(Arc::new(state)),
        }
    }

    fn script(&self, repository: &str, body: &str) {
        let dir = self.root.path().join(repository);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("on-push-to-repo.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn post(&self, body: &str, headers: &[(&str, String)]) -> (StatusCode, String) {
        let mut request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json");
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let response = self
            .router
            .clone()
            .oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn post_signed(&self, body: &str) -> (StatusCode, String) {
        self.post(
            body,
            &[
                ("X-Hub-Signature-256", sign_sha256(SECRET, body.as_bytes())),
                ("X-GitHub-Event", "push".to_string()),
            ],
        )
        .await
    }

    /// Waits until `count` notifications arrived, then a little longer to
    /// catch any extra one.
    async fn wait_for_messages(&self, count: usize) -> Vec<String> {
        for _ in 0..300 {
            if self.sink.messages().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.sink.messages()
    }
}

fn push_body(repository: &str, git_ref: &str) -> String {
    serde_json::json!({
        "ref": git_ref,
        "after": "4b825dc642cb6eb9a060e54bf8d69288fbee4904",
        "repository": { "name": repository },
        "head_commit": { "message": "Ship it", "author": { "name": "Jane" } }
    })
    .to_string()
}

#[tokio::test]
async fn successful_push_reports_start_and_success() {
    let app = TestApp::new(|_| {});
    app.script("site-a", "echo 'Deployed OK'");

    let (status, text) = app.post_signed(&push_body("site-a", "refs/heads/main")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "Webhook received");

    let messages = app.wait_for_messages(2).await;
    assert_eq!(messages.len(), 2, "{:?}", messages);
    assert!(messages[0].contains("STARTING site-a: deployment starting on main"));
    assert!(messages[0].contains("4b825dc by Jane: Ship it"));
    assert!(messages[1].contains("SUCCESS site-a"));
    assert!(!messages.iter().any(|m| m.contains("WARNING")));
}

#[tokio::test]
async fn legacy_sha1_signature_is_accepted() {
    let app = TestApp::new(|_| {});
    app.script("site-a", "true");
    let body = push_body("site-a", "refs/heads/main");

    let (status, _) = app
        .post(&body, &[("X-Hub-Signature", sign_sha1(SECRET, body.as_bytes()))])
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn bad_signature_is_unauthorized_and_runs_nothing() {
    let app = TestApp::new(|_| {});
    app.script("site-a", "touch ran");
    let body = push_body("site-a", "refs/heads/main");

    let (status, _) = app
        .post(&body, &[("X-Hub-Signature-256", sign_sha256("wrong", body.as_bytes()))])
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.post(&body, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert!(app.wait_for_messages(1).await.is_empty());
    assert!(!app.root.path().join("site-a/ran").exists());
}

#[tokio::test]
async fn signature_covers_exact_raw_bytes() {
    let app = TestApp::new(|_| {});
    let body = push_body("site-a", "refs/heads/main");
    let signature = sign_sha256(SECRET, body.as_bytes());
    // Same JSON, different bytes
    let reformatted = serde_json::to_string_pretty(
        &serde_json::from_str::<serde_json::Value>(&body).unwrap(),
    )
    .unwrap();

    let (status, _) = app
        .post(&reformatted, &[("X-Hub-Signature-256", signature)])
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_secret_rejects_everything() {
    let app = TestApp::new(|config| config.webhook_secret = None);
    let body = push_body("site-a", "refs/heads/main");

    let (status, _) = app
        .post(&body, &[("X-Hub-Signature-256", sign_sha256("", body.as_bytes()))])
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn auth_failure_notification_is_opt_in() {
    let app = TestApp::new(|config| config.notify_on_auth_failure = true);

    let (status, _) = app.post(&push_body("site-a", "refs/heads/main"), &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let messages = app.wait_for_messages(1).await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("SECURITY webhook"));
}

#[tokio::test]
async fn other_branch_is_accepted_but_ignored() {
    let app = TestApp::new(|config| config.target_branch = Some("main".to_string()));
    app.script("site-a", "touch ran");

    let (status, text) = app.post_signed(&push_body("site-a", "refs/heads/develop")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "Branch ignored");

    assert!(app.wait_for_messages(1).await.is_empty());
    assert!(!app.root.path().join("site-a/ran").exists());
}

#[tokio::test]
async fn failing_script_still_answers_ok() {
    let app = TestApp::new(|_| {});
    app.script("api", "echo 'cannot bind port' >&2\nexit 1");

    let (status, _) = app.post_signed(&push_body("api", "refs/heads/main")).await;
    assert_eq!(status, StatusCode::OK);

    let messages = app.wait_for_messages(2).await;
    let failures: Vec<_> = messages.iter().filter(|m| m.contains("FAILURE api")).collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("Log tail:\ncannot bind port"));
}

#[tokio::test]
async fn traversal_in_repository_name_is_rejected() {
    let app = TestApp::new(|_| {});

    let (status, _) = app.post_signed(&push_body("../../bin", "refs/heads/main")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(app.wait_for_messages(1).await.is_empty());
}

#[tokio::test]
async fn malformed_payload_is_bad_request() {
    let app = TestApp::new(|_| {});

    let (status, _) = app.post_signed(r#"{"ref":"refs/heads/main"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.post_signed("not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ping_and_foreign_events_do_not_deploy() {
    let app = TestApp::new(|_| {});
    app.script("site-a", "touch ran");
    let body = push_body("site-a", "refs/heads/main");
    let signature = sign_sha256(SECRET, body.as_bytes());

    let (status, text) = app
        .post(
            &body,
            &[
                ("X-Hub-Signature-256", signature.clone()),
                ("X-GitHub-Event", "ping".to_string()),
            ],
        )
        .await;
    assert_eq!((status, text.as_str()), (StatusCode::OK, "pong"));

    let (status, _) = app
        .post(
            &body,
            &[
                ("X-Hub-Signature-256", signature),
                ("X-GitHub-Event", "issues".to_string()),
            ],
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    assert!(app.wait_for_messages(1).await.is_empty());
    assert!(!app.root.path().join("site-a/ran").exists());
}

#[tokio::test]
async fn health_endpoint_reports_status() {
    let app = TestApp::new(|_| {});
    let response = app
        .router
        .clone()
        .oneshot(Request::get("/?format=json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["notifications_enabled"], true);
}
