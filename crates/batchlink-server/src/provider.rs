// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP client for the enrichment provider.
//!
//! Each identifier is submitted on its own with the public callback URL; the
//! provider answers with an opaque request ID and later posts the resolution
//! report to the callback endpoint with that ID in the `Request-Id` header.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use batchlink_core::{SubmissionFailure, Submitter};

use crate::config::ProviderConfig;

/// Body keys that may carry the request ID, in order of preference.
const REQUEST_ID_KEYS: &[&str] = &["request_id", "Request-Id", "requestId", "id"];

/// Longest response snippet kept when the body is not JSON.
const RAW_SNIPPET_LEN: usize = 512;

/// Provider call failures.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No API key is configured.
    #[error("Missing provider API key")]
    MissingApiKey,

    /// The request timed out.
    #[error("Timeout contacting provider")]
    Timeout,

    /// The provider answered with a non-success status.
    #[error("{message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// The body's `error` field, or `HTTP <code>`.
        message: String,
    },

    /// A success response carried no request ID.
    #[error("No request_id returned by provider")]
    MissingRequestId,

    /// Connection or protocol failure.
    #[error("{0}")]
    Transport(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Proxied credits lookup.
#[derive(Debug, Clone, Serialize)]
pub struct CreditsReport {
    /// Whether the provider answered with a 2xx status.
    pub ok: bool,
    /// Provider status code.
    pub status_code: u16,
    /// Provider response body.
    pub data: Value,
}

/// Enrichment provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    config: ProviderConfig,
    callback_url: String,
}

impl HttpProvider {
    /// Create a client that asks the provider to call back `callback_url`.
    pub fn new(config: ProviderConfig, callback_url: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            config,
            callback_url: callback_url.into(),
        })
    }

    /// The callback URL sent with every submission.
    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.config.base_url, self.config.prefix, path)
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.config
            .api_key
            .as_deref()
            .ok_or(ProviderError::MissingApiKey)
    }

    /// Submit one identifier and return the provider's request ID.
    #[instrument(skip(self))]
    pub async fn submit_identifier(&self, identifier: &str) -> Result<String, ProviderError> {
        let api_key = self.api_key()?;

        let response = self
            .client
            .post(self.url("/person"))
            .header("apikey", api_key)
            .json(&json!({
                "items": [identifier],
                "callbackUrl": self.callback_url,
            }))
            .send()
            .await?;

        let status = response.status();
        let header_id = response
            .headers()
            .get("request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = read_body(response).await;

        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            warn!(status = status.as_u16(), %message, "Provider rejected submission");
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let request_id = request_id_from_body(&body)
            .or(header_id)
            .ok_or(ProviderError::MissingRequestId)?;
        debug!(request_id = %request_id, "Provider accepted submission");
        Ok(request_id)
    }

    /// Look up the remaining provider credits.
    pub async fn credits(&self) -> Result<CreditsReport, ProviderError> {
        let api_key = self.api_key()?;

        let response = self
            .client
            .get(self.url("/credits"))
            .query(&[("withoutContacts", "true")])
            .header("apikey", api_key)
            .send()
            .await?;

        let status: StatusCode = response.status();
        Ok(CreditsReport {
            ok: status.is_success(),
            status_code: status.as_u16(),
            data: read_body(response).await,
        })
    }
}

#[async_trait]
impl Submitter for HttpProvider {
    async fn submit(&self, item: &str) -> Result<String, SubmissionFailure> {
        self.submit_identifier(item)
            .await
            .map_err(|e| SubmissionFailure::new(e.to_string()))
    }
}

/// Parse the body as JSON, or keep a short raw snippet of it.
async fn read_body(response: reqwest::Response) -> Value {
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => return json!({ "raw": format!("<unreadable body: {}>", e) }),
    };
    serde_json::from_slice(&bytes).unwrap_or_else(|_| {
        let end = bytes.len().min(RAW_SNIPPET_LEN);
        json!({ "raw": String::from_utf8_lossy(&bytes[..end]) })
    })
}

/// First usable request ID among the known body keys.
fn request_id_from_body(body: &Value) -> Option<String> {
    REQUEST_ID_KEYS.iter().find_map(|key| match body.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
