// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for HTTP tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::MockServer;

use batchlink_core::{CorrelationService, FilePersistence};
use batchlink_server::config::ProviderConfig;
use batchlink_server::http::{AppState, create_router};
use batchlink_server::notifier::{NotificationDispatcher, Notice, Notifier, NotifyError};
use batchlink_server::provider::HttpProvider;

pub const API_KEY: &str = "test-key";
pub const CALLBACK_URL: &str = "http://callback.test/callback";
pub const BOUNDARY: &str = "batchlink-test-boundary";

/// Notifier that keeps every notice.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notice> {
        self.sent.lock().unwrap().clone()
    }

    /// Wait for background deliveries to land.
    pub async fn wait_for(&self, count: usize) -> Vec<Notice> {
        for _ in 0..100 {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.sent()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notice: &Notice) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notice.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// A router over a file store in a temp dir, talking to a mock provider.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub provider: MockServer,
    pub notifier: Arc<RecordingNotifier>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_api_key(Some(API_KEY)).await
    }

    pub async fn with_api_key(api_key: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::open(dir.path()).await.unwrap();
        let service = Arc::new(CorrelationService::from_backend(Arc::new(store)));

        let provider = MockServer::start().await;
        let client = HttpProvider::new(
            ProviderConfig {
                base_url: provider.uri(),
                prefix: "/api/v1".to_string(),
                api_key: api_key.map(str::to_string),
                timeout: Duration::from_secs(5),
            },
            CALLBACK_URL,
        )
        .unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            service.clone(),
            notifier.clone(),
        ));
        let state = AppState::new(service, Arc::new(client), dispatcher);

        Self {
            router: create_router(state.clone()),
            state,
            provider,
            notifier,
            _dir: dir,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (u16, Vec<u8>, Response<()>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes().to_vec();
        (parts.status.as_u16(), bytes, Response::from_parts(parts, ()))
    }

    pub async fn send_json(&self, request: Request<Body>) -> (u16, Value) {
        let (status, bytes, _) = self.send(request).await;
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn get(&self, uri: &str) -> (u16, Value) {
        self.send_json(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn upload(&self, email: Option<&str>, csv: &str) -> (u16, Value) {
        self.send_json(upload_request(email, csv)).await
    }

    pub async fn callback(&self, request_id: &str, body: Value) -> (u16, Value) {
        self.send_json(
            Request::post("/callback")
                .header("Request-Id", request_id)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }
}

/// Multipart upload request.
pub fn upload_request(email: Option<&str>, csv: &str) -> Request<Body> {
    let mut body = String::new();
    if let Some(email) = email {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"user_email\"\r\n\r\n{email}\r\n"
        ));
    }
    body.push_str(&format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"csv_file\"; filename=\"input.csv\"\r\nContent-Type: text/csv\r\n\r\n{csv}\r\n--{BOUNDARY}--\r\n"
    ));

    Request::post("/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn profile(name: &str) -> String {
    format!("https://www.linkedin.com/in/{name}")
}
