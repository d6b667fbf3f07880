// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route handlers.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

use batchlink_core::{BatchSummary, CoreError, Outcome, Resolved};

use crate::error::ServerError;
use crate::rows::render_csv;
use crate::upload::{UploadError, parse_identifiers};

use super::state::AppState;

/// Default request body limit (uploads included).
pub const DEFAULT_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Header carrying the provider's request ID on callbacks.
pub const REQUEST_ID_HEADER: &str = "request-id";

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Batch enrichment</title></head>
<body>
<h1>Batch enrichment</h1>
<form action="/upload" method="post" enctype="multipart/form-data">
  <p><label>CSV of profile URLs <input type="file" name="csv_file" accept=".csv" required></label></p>
  <p><label>Email <input type="email" name="user_email" required></label></p>
  <p><button type="submit">Upload</button></p>
</form>
</body>
</html>
"#;

/// Create the router with the default body limit.
pub fn create_router(state: AppState) -> Router {
    create_router_with_body_limit(state, DEFAULT_BODY_LIMIT)
}

/// Create the router with a custom body limit.
pub fn create_router_with_body_limit(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/credits", get(credits))
        .route("/upload", post(upload))
        .route("/callback", post(callback))
        .route("/status/{batch_id}", get(status))
        .route("/download/{batch_id}", get(download))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "batchlink" }))
}

async fn credits(State(state): State<AppState>) -> Result<impl IntoResponse, ServerError> {
    let report = state.provider.credits().await?;
    Ok(Json(report))
}

/// Accepted upload.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub status: String,
    pub batch_id: String,
    pub submitted: usize,
    pub errors: usize,
    pub callback_url: String,
}

#[instrument(skip_all)]
async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServerError> {
    let mut content: Option<Bytes> = None;
    let mut owner: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::Multipart(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "csv_file" => {
                content = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| UploadError::Multipart(e.to_string()))?,
                );
            }
            "user_email" => {
                owner = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| UploadError::Multipart(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let content = content.ok_or(UploadError::MissingField("csv_file"))?;
    let owner = owner
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .ok_or(UploadError::MissingField("user_email"))?;

    let identifiers = parse_identifiers(&content)?;
    info!(items = identifiers.len(), owner = %owner, "Upload accepted");

    let started = state
        .service
        .begin_batch(&owner, identifiers, &content, state.provider.as_ref())
        .await?;

    if let Some(event) = started.completion {
        state.dispatcher.spawn_completion(event);
    }

    Ok(Json(UploadResponse {
        status: "accepted".to_string(),
        batch_id: started.batch_id,
        submitted: started.submitted,
        errors: started.failed,
        callback_url: state.provider.callback_url().to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    request_id: Option<String>,
}

async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or(query.request_id.filter(|v| !v.trim().is_empty()))
        .ok_or_else(|| ServerError::BadCallback("missing Request-Id header".to_string()))?;

    let outcome = outcome_from_body(&body)?;

    match state.service.handle_resolution(&request_id, outcome).await {
        Ok(Resolved::Pending { batch_id, remaining }) => Ok(Json(json!({
            "status": "accepted",
            "batch_id": batch_id,
            "remaining": remaining,
        }))
        .into_response()),
        Ok(Resolved::Completed(event)) => {
            let batch_id = event.batch_id.clone();
            state.dispatcher.spawn_completion(event);
            Ok(Json(json!({
                "status": "accepted",
                "batch_id": batch_id,
                "complete": true,
            }))
            .into_response())
        }
        Ok(Resolved::Duplicate { batch_id }) => Ok(Json(json!({
            "status": "accepted",
            "batch_id": batch_id,
            "duplicate": true,
        }))
        .into_response()),
        Err(CoreError::UnknownRequest { .. }) => {
            warn!(request_id = %request_id, "Callback for unknown request id");
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "status": "accepted", "warning": "unknown request id" })),
            )
                .into_response())
        }
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Callback processing failed");
            report_callback_failure(&state, &request_id, &e.to_string()).await;
            Err(e.into())
        }
    }
}

/// Success payload, or a failure when the body is an object with `error`.
fn outcome_from_body(body: &[u8]) -> Result<Outcome, ServerError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Outcome::Success(Value::Null));
    }
    let payload: Value = serde_json::from_slice(body)
        .map_err(|e| ServerError::BadCallback(format!("body is not JSON: {}", e)))?;

    match payload.get("error") {
        Some(Value::String(reason)) => Ok(Outcome::Failure(reason.clone())),
        Some(other) if payload.is_object() => Ok(Outcome::Failure(other.to_string())),
        _ => Ok(Outcome::Success(payload)),
    }
}

/// Tell the batch owner, when the batch can be found.
async fn report_callback_failure(state: &AppState, request_id: &str, reason: &str) {
    let batch = match state.service.batch_for_request(request_id).await {
        Ok(batch_id) => state.service.query_status(&batch_id).await,
        Err(e) => Err(e),
    };
    match batch {
        Ok(batch) => {
            let dispatcher = state.dispatcher.clone();
            let reason = reason.to_string();
            tokio::spawn(async move {
                dispatcher
                    .notify_error(&batch.batch_id, &batch.owner_contact, &reason)
                    .await;
            });
        }
        Err(e) => warn!(request_id, error = %e, "No batch to notify about callback failure"),
    }
}

async fn status(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchSummary>, ServerError> {
    Ok(Json(state.service.summary(&batch_id).await?))
}

async fn download(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Response, ServerError> {
    // 404 for unknown batches rather than an empty CSV.
    state.service.query_status(&batch_id).await?;
    let results = state.service.results(&batch_id).await?;
    let csv = render_csv(&results)?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"results_{}.csv\"", batch_id),
            ),
        ],
        csv,
    )
        .into_response())
}
