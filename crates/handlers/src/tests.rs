// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use std::sync::Arc;

use axum::{body::Body, Router};
use camino::Utf8PathBuf;
use http_body_util::BodyExt;
use hyper::{Request, StatusCode};
use tabfleet_core::{
    monitor::MonitoringConfig,
    registry::PluginRegistry,
    scheduler::SchedulerConfig,
    testing::{FakeBroker, FakeMessagePlugin},
    Core, CoreOptions,
};
use tabfleet_storage::SystemClock;
use tabfleet_storage_mem::MemRepositoryFactory;
use tower::ServiceExt;

use crate::{router, AppState, ServePaths};

fn app() -> Router {
    app_with(
        PluginRegistry::builder()
            .message(Ok(Arc::new(FakeMessagePlugin::new("wechat"))))
            .build()
            .expect("registry"),
    )
}

fn app_with(registry: PluginRegistry) -> Router {
    let core = Core::init(CoreOptions {
        broker: Arc::new(FakeBroker::new()),
        registry: Arc::new(registry),
        repos: Arc::new(MemRepositoryFactory::new()),
        clock: Arc::new(SystemClock),
        scheduler: SchedulerConfig::default(),
        monitoring: MonitoringConfig::default(),
    });
    router(AppState {
        core,
        paths: ServePaths {
            cookie_dir: Utf8PathBuf::from("/tmp/tabfleet-test/cookies"),
            video_dir: Utf8PathBuf::from("/tmp/tabfleet-test/videos"),
            avatar_dir: Utf8PathBuf::from("/tmp/tabfleet-test/avatars"),
        },
    })
}

async fn send(
    app: Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request"),
    };
    let response = app.oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn monitoring_status_answers_the_standard_envelope() {
    let (status, body) = send(app(), "GET", "/monitoring/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], serde_json::json!(true));
    assert!(body["data"].as_array().expect("data array").is_empty());
}

#[tokio::test]
async fn monitoring_start_rejects_missing_identifiers() {
    let (status, body) = send(
        app(),
        "POST",
        "/monitoring/start",
        Some(serde_json::json!({
            "platform": "",
            "accountId": "",
            "cookieFile": "/cookies/x.json",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], serde_json::json!(false));
}

#[tokio::test]
async fn monitoring_start_succeeds_against_the_fake_platform() {
    let (status, body) = send(
        app(),
        "POST",
        "/monitoring/start",
        Some(serde_json::json!({
            "platform": "wechat",
            "accountId": "alice",
            "cookieFile": "/cookies/wechat_alice_1.json",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], serde_json::json!(true));
    assert_eq!(body["data"]["accountKey"], serde_json::json!("wechat_alice"));
}

#[tokio::test]
async fn sync_for_an_unknown_platform_is_a_failure_result_not_an_error() {
    let (status, body) = send(
        app(),
        "POST",
        "/sync",
        Some(serde_json::json!({
            "platform": "weibo",
            "accountId": "alice",
            "cookieFile": "/cookies/weibo_alice_1.json",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], serde_json::json!(false));
    assert!(
        body["error"]
            .as_str()
            .expect("error message")
            .contains("message plugin"),
    );
}

#[tokio::test]
async fn avatar_paths_with_traversal_components_are_rejected() {
    let (status, body) = send(app(), "GET", "/avatar/wechat/..hidden/x.png", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], serde_json::json!(false));
}

#[tokio::test]
async fn missing_avatars_answer_not_found() {
    let (status, _) = send(app(), "GET", "/avatar/wechat/alice/missing.png", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn post_video_rejects_unknown_platform_type_codes() {
    let (status, body) = send(
        app(),
        "POST",
        "/postVideo",
        Some(serde_json::json!({
            "fileList": ["demo.mp4"],
            "accountList": ["wechat_alice_1.json"],
            "type": 9,
            "title": "t",
            "tags": [],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], serde_json::json!(400));
}

#[tokio::test]
async fn search_requires_a_keyword() {
    let (status, _) = send(app(), "GET", "/search", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn threads_lists_the_empty_store() {
    let (status, body) = send(app(), "GET", "/threads?platform=wechat", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], serde_json::json!(true));
    assert!(body["data"].as_array().expect("data array").is_empty());
}
