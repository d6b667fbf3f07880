// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for batchlink-core.
//!
//! Two traits split the durable state:
//!
//! - [`RecordStore`] owns the small, frequently rewritten batch status record,
//!   the original uploaded artifact, and the append-only raw results log.
//! - [`RequestIndex`] maps provider request IDs back to their batch.
//!
//! Both backends ([`SqlitePersistence`], [`FilePersistence`]) implement both
//! traits. Writes of a batch record are atomic: a reader observes either the
//! previous or the new record, never a mix, even across a crash.

pub mod file;
pub mod sqlite;

pub use self::file::FilePersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::batch::{Batch, BatchStatus, ResultEntry};
use crate::error::{CoreError, Result};

/// Listing entry returned by [`RecordStore::list_batches`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchListing {
    /// Batch identifier.
    pub batch_id: String,
    /// Lifecycle status.
    pub status: BatchStatus,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
    /// When the batch completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Whether the completion notification was delivered.
    pub notified: bool,
}

impl From<&Batch> for BatchListing {
    fn from(batch: &Batch) -> Self {
        Self {
            batch_id: batch.batch_id.clone(),
            status: batch.status,
            updated_at: batch.updated_at,
            completed_at: batch.completed_at,
            notified: batch.notified_at.is_some(),
        }
    }
}

/// Durable storage for batch records and raw results.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new batch record and its original input artifact verbatim.
    ///
    /// Fails with [`CoreError::BatchAlreadyExists`] if the ID is taken.
    async fn create(&self, batch: &Batch, original_input: &[u8]) -> Result<()>;

    /// Read the current record, failing with [`CoreError::BatchNotFound`].
    async fn read(&self, batch_id: &str) -> Result<Batch>;

    /// Atomically replace the full record stored under `batch.batch_id`.
    async fn write(&self, batch: &Batch) -> Result<()>;

    /// Append a raw payload to the batch's results log.
    ///
    /// Independent of the status record. Appending a request ID that is
    /// already present keeps the first payload. Fails with
    /// [`CoreError::BatchNotFound`] for an unknown batch.
    async fn append_result(
        &self,
        batch_id: &str,
        request_id: &str,
        payload: &serde_json::Value,
    ) -> Result<()>;

    /// Read the raw results log in append order.
    async fn read_results(&self, batch_id: &str) -> Result<Vec<ResultEntry>>;

    /// Read the original input artifact.
    async fn read_input(&self, batch_id: &str) -> Result<Vec<u8>>;

    /// List batches, optionally filtered by status, oldest first.
    ///
    /// Corrupt records are logged and left out.
    async fn list_batches(&self, status: Option<BatchStatus>) -> Result<Vec<BatchListing>>;
}

/// Durable mapping from request ID to owning batch ID.
#[async_trait]
pub trait RequestIndex: Send + Sync {
    /// Register `request_id` as belonging to `batch_id`.
    ///
    /// Re-registering under the same batch is a no-op; registering under a
    /// different batch fails with [`CoreError::Conflict`].
    async fn register(&self, request_id: &str, batch_id: &str) -> Result<()>;

    /// Resolve the owning batch, failing with [`CoreError::UnknownRequest`].
    async fn resolve(&self, request_id: &str) -> Result<String>;
}

/// Decode and shape-check a stored record.
pub(crate) fn decode_record(batch_id: &str, raw: &[u8]) -> Result<Batch> {
    let batch: Batch =
        serde_json::from_slice(raw).map_err(|e| CoreError::corrupt(batch_id, e))?;

    if batch.batch_id != batch_id {
        return Err(CoreError::corrupt(
            batch_id,
            format!("record is keyed '{}' but names '{}'", batch_id, batch.batch_id),
        ));
    }
    batch
        .validate()
        .map_err(|details| CoreError::corrupt(batch_id, details))?;

    Ok(batch)
}

/// Decide a registration attempt against an existing index entry.
pub(crate) fn check_registration(
    request_id: &str,
    existing_batch_id: &str,
    batch_id: &str,
) -> Result<()> {
    if existing_batch_id == batch_id {
        Ok(())
    } else {
        Err(CoreError::Conflict {
            request_id: request_id.to_string(),
            existing_batch_id: existing_batch_id.to_string(),
            batch_id: batch_id.to_string(),
        })
    }
}
