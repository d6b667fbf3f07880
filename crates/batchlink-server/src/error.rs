// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server error type and its HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use batchlink_core::CoreError;

use crate::config::ConfigError;
use crate::notifier::NotifyError;
use crate::provider::ProviderError;
use crate::upload::UploadError;

/// Errors surfaced by the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    /// A callback request was malformed.
    #[error("Invalid callback: {0}")]
    BadCallback(String),

    #[error("Failed to render CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Core(e) => match e {
                CoreError::BatchNotFound { .. } | CoreError::UnknownRequest { .. } => {
                    StatusCode::NOT_FOUND
                }
                CoreError::BatchAlreadyExists { .. } | CoreError::AlreadyResolved { .. } => {
                    StatusCode::CONFLICT
                }
                CoreError::ValidationError { .. } => StatusCode::BAD_REQUEST,
                // Conflicts, corrupt records and storage failures are server faults.
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Provider(ProviderError::MissingApiKey) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Provider(ProviderError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            Self::Provider(_) | Self::Notify(_) => StatusCode::BAD_GATEWAY,
            Self::Upload(_) | Self::BadCallback(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) | Self::Csv(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Core(e) => e.error_code(),
            Self::Config(_) => "CONFIG_ERROR",
            Self::Provider(_) => "PROVIDER_ERROR",
            Self::Notify(_) => "NOTIFY_ERROR",
            Self::Upload(_) => "INVALID_UPLOAD",
            Self::BadCallback(_) => "INVALID_CALLBACK",
            Self::Csv(_) | Self::Io(_) => "INTERNAL_ERROR",
        }
    }
}

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.error_code(), error = %self, "Request failed");
        }
        let body = ApiError {
            error: self.to_string(),
            code: self.error_code(),
        };
        (status, Json(body)).into_response()
    }
}
