// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application state for HTTP handlers.

use std::sync::Arc;

use batchlink_core::CorrelationService;

use crate::notifier::NotificationDispatcher;
use crate::provider::HttpProvider;

/// Shared handler dependencies.
#[derive(Clone)]
pub struct AppState {
    /// Correlation core.
    pub service: Arc<CorrelationService>,
    /// Provider client, also the batch submitter.
    pub provider: Arc<HttpProvider>,
    /// Completion and error notifications.
    pub dispatcher: Arc<NotificationDispatcher>,
}

impl AppState {
    /// Create the state.
    pub fn new(
        service: Arc<CorrelationService>,
        provider: Arc<HttpProvider>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            service,
            provider,
            dispatcher,
        }
    }
}
