// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{debug, warn};

use crate::batch::{Batch, BatchStatus, ResultEntry};
use crate::error::{CoreError, Result};
use crate::migrations::SQLITE as MIGRATOR;

use super::{BatchListing, RecordStore, RequestIndex, check_registration, decode_record};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The schema must already be migrated (see [`crate::migrations`]).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::storage(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                CoreError::storage(
                    "connect",
                    format!("Failed to connect to SQLite at {:?}: {}", path, e),
                )
            })?;

        MIGRATOR.run(&pool).await.map_err(|e| {
            CoreError::storage("migrate", format!("Failed to run migrations: {}", e))
        })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn batch_exists(&self, batch_id: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM batches WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait::async_trait]
impl RecordStore for SqlitePersistence {
    async fn create(&self, batch: &Batch, original_input: &[u8]) -> Result<()> {
        let record = serde_json::to_string(batch)?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO batches (batch_id, status, record, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&batch.batch_id)
        .bind(batch.status.as_str())
        .bind(&record)
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Err(CoreError::BatchAlreadyExists {
                    batch_id: batch.batch_id.clone(),
                });
            }
            return Err(e.into());
        }

        sqlx::query("INSERT INTO batch_inputs (batch_id, content) VALUES (?1, ?2)")
            .bind(&batch.batch_id)
            .bind(original_input)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn read(&self, batch_id: &str) -> Result<Batch> {
        let record =
            sqlx::query_scalar::<_, String>("SELECT record FROM batches WHERE batch_id = ?")
                .bind(batch_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| CoreError::BatchNotFound {
                    batch_id: batch_id.to_string(),
                })?;

        decode_record(batch_id, record.as_bytes())
    }

    async fn write(&self, batch: &Batch) -> Result<()> {
        let record = serde_json::to_string(batch)?;

        // Single statement: SQLite applies it atomically or not at all.
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET record = ?1,
                status = ?2,
                updated_at = ?3
            WHERE batch_id = ?4
            "#,
        )
        .bind(&record)
        .bind(batch.status.as_str())
        .bind(batch.updated_at)
        .bind(&batch.batch_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::BatchNotFound {
                batch_id: batch.batch_id.clone(),
            });
        }
        Ok(())
    }

    async fn append_result(
        &self,
        batch_id: &str,
        request_id: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        if !self.batch_exists(batch_id).await? {
            return Err(CoreError::BatchNotFound {
                batch_id: batch_id.to_string(),
            });
        }

        let payload = serde_json::to_string(payload)?;
        let result = sqlx::query(
            r#"
            INSERT INTO batch_results (batch_id, request_id, payload, received_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (batch_id, request_id) DO NOTHING
            "#,
        )
        .bind(batch_id)
        .bind(request_id)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(batch_id, request_id, "Result already logged, keeping first payload");
        }
        Ok(())
    }

    async fn read_results(&self, batch_id: &str) -> Result<Vec<ResultEntry>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT request_id, payload
            FROM batch_results
            WHERE batch_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() && !self.batch_exists(batch_id).await? {
            return Err(CoreError::BatchNotFound {
                batch_id: batch_id.to_string(),
            });
        }

        rows.into_iter()
            .map(|(request_id, payload)| {
                let payload = serde_json::from_str(&payload).map_err(|e| {
                    CoreError::corrupt(&format!("{}/{}", batch_id, request_id), e)
                })?;
                Ok(ResultEntry {
                    request_id,
                    payload,
                })
            })
            .collect()
    }

    async fn read_input(&self, batch_id: &str) -> Result<Vec<u8>> {
        sqlx::query_scalar::<_, Vec<u8>>("SELECT content FROM batch_inputs WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })
    }

    async fn list_batches(&self, status: Option<BatchStatus>) -> Result<Vec<BatchListing>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT batch_id, record
            FROM batches
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at ASC, batch_id ASC
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        let mut listings = Vec::with_capacity(rows.len());
        for (batch_id, record) in rows {
            match decode_record(&batch_id, record.as_bytes()) {
                Ok(batch) => listings.push(BatchListing::from(&batch)),
                // One bad record must not hide the rest; `read` still reports it.
                Err(e @ CoreError::CorruptRecord { .. }) => {
                    warn!(batch_id, error = %e, "Skipping corrupt batch record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(listings)
    }
}

#[async_trait::async_trait]
impl RequestIndex for SqlitePersistence {
    async fn register(&self, request_id: &str, batch_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO request_index (request_id, batch_id, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(request_id)
        .bind(batch_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Entries are immutable once written, so this read cannot race.
        let existing = self.resolve(request_id).await?;
        check_registration(request_id, &existing, batch_id)
    }

    async fn resolve(&self, request_id: &str) -> Result<String> {
        sqlx::query_scalar::<_, String>("SELECT batch_id FROM request_index WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::UnknownRequest {
                request_id: request_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Outcome;
    use serde_json::json;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    #[tokio::test]
    async fn test_create_and_read_batch() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let mut batch = Batch::open("b-1", "owner@example.com", 2);
        batch.track("r-1").unwrap();

        persistence
            .create(&batch, b"https://x/1\nhttps://x/2\n")
            .await
            .expect("Failed to create batch");

        let loaded = persistence.read("b-1").await.expect("Failed to read");
        assert_eq!(loaded, batch);

        let input = persistence.read_input("b-1").await.unwrap();
        assert_eq!(input, b"https://x/1\nhttps://x/2\n");
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let batch = Batch::open("b-1", "owner@example.com", 1);

        persistence.create(&batch, b"").await.unwrap();
        let err = persistence.create(&batch, b"").await.unwrap_err();
        assert!(matches!(err, CoreError::BatchAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_read_and_write_missing_batch() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let err = persistence.read("nope").await.unwrap_err();
        assert!(matches!(err, CoreError::BatchNotFound { .. }));

        let err = persistence
            .write(&Batch::open("nope", "o", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BatchNotFound { .. }));
    }

    #[tokio::test]
    async fn test_write_replaces_record() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let mut batch = Batch::open("b-1", "owner@example.com", 1);
        batch.track("r-1").unwrap();
        persistence.create(&batch, b"").await.unwrap();

        let transition = batch
            .apply_resolution("r-1", Outcome::Success(json!({"ok": true})))
            .unwrap();
        assert!(transition.triggered_completion());
        persistence.write(&batch).await.unwrap();

        let loaded = persistence.read("b-1").await.unwrap();
        assert_eq!(loaded.status, BatchStatus::Complete);
        assert_eq!(loaded.results.len(), 1);

        let complete = persistence
            .list_batches(Some(BatchStatus::Complete))
            .await
            .unwrap();
        assert_eq!(complete.len(), 1);
        assert!(
            persistence
                .list_batches(Some(BatchStatus::Processing))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_corrupt_record_fails_fast() {
        let persistence = SqlitePersistence::new(test_pool().await);
        sqlx::query(
            "INSERT INTO batches (batch_id, status, record, created_at, updated_at) \
             VALUES ('b-x', 'processing', '{\"pending\": 3}', '2025-01-01', '2025-01-01')",
        )
        .execute(persistence.pool())
        .await
        .unwrap();

        let err = persistence.read("b-x").await.unwrap_err();
        assert!(matches!(err, CoreError::CorruptRecord { .. }));
    }

    #[tokio::test]
    async fn test_append_result_keeps_first_payload() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence
            .create(&Batch::open("b-1", "o", 2), b"")
            .await
            .unwrap();

        persistence
            .append_result("b-1", "r-2", &json!({"n": 2}))
            .await
            .unwrap();
        persistence
            .append_result("b-1", "r-1", &json!({"n": 1}))
            .await
            .unwrap();
        persistence
            .append_result("b-1", "r-2", &json!({"n": 99}))
            .await
            .unwrap();

        let results = persistence.read_results("b-1").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].request_id, "r-2");
        assert_eq!(results[0].payload, json!({"n": 2}));
        assert_eq!(results[1].request_id, "r-1");

        let err = persistence.read_results("missing").await.unwrap_err();
        assert!(matches!(err, CoreError::BatchNotFound { .. }));
    }

    #[tokio::test]
    async fn test_request_index_register_and_resolve() {
        let persistence = SqlitePersistence::new(test_pool().await);

        persistence.register("r-1", "b-1").await.unwrap();
        // Idempotent for the same batch.
        persistence.register("r-1", "b-1").await.unwrap();
        assert_eq!(persistence.resolve("r-1").await.unwrap(), "b-1");

        let err = persistence.register("r-1", "b-2").await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
        assert_eq!(persistence.resolve("r-1").await.unwrap(), "b-1");

        let err = persistence.resolve("r-unknown").await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownRequest { .. }));
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("batchlink.db");

        let persistence = SqlitePersistence::from_path(&path).await.unwrap();
        persistence
            .create(&Batch::open("b-1", "o", 1), b"x")
            .await
            .unwrap();
        drop(persistence);

        let reopened = SqlitePersistence::from_path(&path).await.unwrap();
        assert_eq!(reopened.read("b-1").await.unwrap().total_items, 1);
    }
}
