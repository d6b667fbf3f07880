// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for batchlink-core integration tests.
//!
//! Provides a scripted submitter and service constructors for both backends.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;

use batchlink_core::persistence::{FilePersistence, SqlitePersistence};
use batchlink_core::{CorrelationService, SubmissionFailure, Submitter};

/// Submitter that accepts every item as `req-<item>` unless told to fail it.
#[derive(Default)]
pub struct ScriptedSubmitter {
    failures: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    calls: AtomicUsize,
}

impl ScriptedSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make submission of `item` fail with `reason`.
    pub fn failing(mut self, item: &str, reason: &str) -> Self {
        self.failures.insert(item.to_string(), reason.to_string());
        self
    }

    /// Delay the submission of `item`.
    pub fn delayed(mut self, item: &str, delay: Duration) -> Self {
        self.delays.insert(item.to_string(), delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Submitter for ScriptedSubmitter {
    async fn submit(&self, item: &str) -> Result<String, SubmissionFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(item) {
            tokio::time::sleep(*delay).await;
        }
        match self.failures.get(item) {
            Some(reason) => Err(SubmissionFailure::new(reason.clone())),
            None => Ok(request_id(item)),
        }
    }
}

/// The request ID [`ScriptedSubmitter`] hands out for `item`.
pub fn request_id(item: &str) -> String {
    format!("req-{}", item)
}

/// `n` distinct item names.
pub fn items(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("item{}", i)).collect()
}

/// Service over a fresh in-memory SQLite database.
pub async fn sqlite_service() -> CorrelationService {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory database");
    batchlink_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    CorrelationService::from_backend(Arc::new(SqlitePersistence::new(pool)))
}

/// Service over a file store rooted at `root`.
pub async fn file_service(root: &Path) -> CorrelationService {
    let store = FilePersistence::open(root)
        .await
        .expect("Failed to open file store");
    CorrelationService::from_backend(Arc::new(store))
}
