// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem-backed persistence implementation.
//!
//! Layout under the data root:
//!
//! ```text
//! batches/<batch_id>/status.json    - batch record (replaced atomically)
//! batches/<batch_id>/original.bin   - uploaded artifact, verbatim
//! batches/<batch_id>/results.jsonl  - raw results log, one JSON line per append
//! requests/<request_id>             - owning batch ID
//! ```
//!
//! Record writes go to a temp file in the same directory, are fsynced, and
//! renamed over the old record, followed by a directory fsync. A crash at any
//! point leaves either the old or the new record in place.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::batch::{Batch, BatchStatus, ResultEntry};
use crate::error::{CoreError, Result};

use super::{BatchListing, RecordStore, RequestIndex, check_registration, decode_record};

const STATUS_FILE: &str = "status.json";
const INPUT_FILE: &str = "original.bin";
const RESULTS_FILE: &str = "results.jsonl";
const MAX_KEY_LEN: usize = 200;

/// One line of the results log.
#[derive(Debug, Serialize, Deserialize)]
struct ResultLine {
    request_id: String,
    payload: serde_json::Value,
    received_at: chrono::DateTime<Utc>,
}

/// Filesystem-backed persistence provider.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    root: PathBuf,
}

impl FilePersistence {
    /// Open (and create if needed) a data root.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in ["batches", "requests"] {
            tokio::fs::create_dir_all(root.join(dir))
                .await
                .map_err(|e| {
                    CoreError::storage(
                        "create_dir",
                        format!("Failed to create {:?}: {}", root.join(dir), e),
                    )
                })?;
        }
        Ok(Self { root })
    }

    /// The data root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn batch_dir(&self, batch_id: &str) -> Result<PathBuf> {
        validate_key("batch_id", batch_id)?;
        Ok(self.root.join("batches").join(batch_id))
    }

    fn request_path(&self, request_id: &str) -> Result<PathBuf> {
        validate_key("request_id", request_id)?;
        Ok(self.root.join("requests").join(request_id))
    }

    async fn ensure_batch(&self, batch_id: &str) -> Result<PathBuf> {
        let dir = self.batch_dir(batch_id)?;
        if !tokio::fs::try_exists(dir.join(STATUS_FILE)).await? {
            return Err(CoreError::BatchNotFound {
                batch_id: batch_id.to_string(),
            });
        }
        Ok(dir)
    }
}

/// Keys become file names, so restrict them to a safe alphabet.
fn validate_key(field: &str, key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::validation(
            field,
            format!("'{}' is not usable as a storage key", key),
        ))
    }
}

/// Atomically place `contents` at `path`.
///
/// With `overwrite == false` the call fails with `AlreadyExists` instead of
/// replacing an existing file.
async fn write_atomic(path: PathBuf, contents: Vec<u8>, overwrite: bool) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let dir = path
            .parent()
            .ok_or_else(|| std::io::Error::other(format!("{:?} has no parent", path)))?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        if overwrite {
            tmp.persist(&path).map_err(|e| e.error)?;
        } else {
            tmp.persist_noclobber(&path).map_err(|e| e.error)?;
        }

        // Make the rename itself durable.
        std::fs::File::open(dir)?.sync_all()?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Parse the results log, keeping the first payload per request.
///
/// Every append starts on a fresh line, so a write torn by a crash occupies
/// a line of its own and is skipped. A line that is complete but malformed
/// is corruption.
fn parse_results(batch_id: &str, raw: &str) -> Result<Vec<ResultEntry>> {
    let mut seen = std::collections::HashSet::new();
    let mut entries = Vec::new();

    for (i, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: ResultLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) if e.classify() == serde_json::error::Category::Eof => {
                warn!(batch_id, line = i + 1, "Skipping torn line in results log");
                continue;
            }
            Err(e) => {
                return Err(CoreError::corrupt(
                    &format!("{}/{}", batch_id, RESULTS_FILE),
                    format!("line {}: {}", i + 1, e),
                ));
            }
        };
        if seen.insert(parsed.request_id.clone()) {
            entries.push(ResultEntry {
                request_id: parsed.request_id,
                payload: parsed.payload,
            });
        }
    }

    Ok(entries)
}

#[async_trait::async_trait]
impl RecordStore for FilePersistence {
    async fn create(&self, batch: &Batch, original_input: &[u8]) -> Result<()> {
        let dir = self.batch_dir(&batch.batch_id)?;

        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(CoreError::BatchAlreadyExists {
                    batch_id: batch.batch_id.clone(),
                });
            }
            Err(e) => return Err(CoreError::storage("create", e)),
        }

        write_atomic(dir.join(INPUT_FILE), original_input.to_vec(), false).await?;
        // The status file is written last: its presence marks the batch as created.
        write_atomic(dir.join(STATUS_FILE), serde_json::to_vec_pretty(batch)?, false).await?;
        Ok(())
    }

    async fn read(&self, batch_id: &str) -> Result<Batch> {
        let path = self.batch_dir(batch_id)?.join(STATUS_FILE);
        match tokio::fs::read(&path).await {
            Ok(raw) => decode_record(batch_id, &raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CoreError::BatchNotFound {
                batch_id: batch_id.to_string(),
            }),
            Err(e) => Err(CoreError::storage("read", e)),
        }
    }

    async fn write(&self, batch: &Batch) -> Result<()> {
        let dir = self.ensure_batch(&batch.batch_id).await?;
        write_atomic(dir.join(STATUS_FILE), serde_json::to_vec_pretty(batch)?, true)
            .await
            .map_err(|e| CoreError::storage("write", e))
    }

    async fn append_result(
        &self,
        batch_id: &str,
        request_id: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let dir = self.ensure_batch(batch_id).await?;
        let mut line = vec![b'\n'];
        serde_json::to_writer(
            &mut line,
            &ResultLine {
                request_id: request_id.to_string(),
                payload: payload.clone(),
                received_at: Utc::now(),
            },
        )?;

        // A single append write; duplicates are collapsed on read.
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(RESULTS_FILE))
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        debug!(batch_id, request_id, bytes = line.len(), "Appended result");
        Ok(())
    }

    async fn read_results(&self, batch_id: &str) -> Result<Vec<ResultEntry>> {
        let dir = self.ensure_batch(batch_id).await?;
        match tokio::fs::read_to_string(dir.join(RESULTS_FILE)).await {
            Ok(raw) => parse_results(batch_id, &raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(CoreError::storage("read_results", e)),
        }
    }

    async fn read_input(&self, batch_id: &str) -> Result<Vec<u8>> {
        let dir = self.ensure_batch(batch_id).await?;
        Ok(tokio::fs::read(dir.join(INPUT_FILE)).await?)
    }

    async fn list_batches(&self, status: Option<BatchStatus>) -> Result<Vec<BatchListing>> {
        let mut listings = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("batches")).await?;

        while let Some(entry) = entries.next_entry().await? {
            let Some(batch_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let batch = match self.read(&batch_id).await {
                Ok(batch) => batch,
                Err(CoreError::BatchNotFound { .. }) => {
                    // Directory without a status file: create() was interrupted.
                    debug!(batch_id, "Skipping incomplete batch directory");
                    continue;
                }
                Err(e @ CoreError::CorruptRecord { .. }) => {
                    warn!(batch_id, error = %e, "Skipping corrupt batch record");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if status.is_none_or(|s| s == batch.status) {
                listings.push((batch.created_at, BatchListing::from(&batch)));
            }
        }

        listings.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.batch_id.cmp(&b.1.batch_id)));
        Ok(listings.into_iter().map(|(_, listing)| listing).collect())
    }
}

#[async_trait::async_trait]
impl RequestIndex for FilePersistence {
    async fn register(&self, request_id: &str, batch_id: &str) -> Result<()> {
        let path = self.request_path(request_id)?;

        match write_atomic(path, batch_id.as_bytes().to_vec(), false).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing = self.resolve(request_id).await?;
                check_registration(request_id, &existing, batch_id)
            }
            Err(e) => Err(CoreError::storage("register", e)),
        }
    }

    async fn resolve(&self, request_id: &str) -> Result<String> {
        let unknown = || CoreError::UnknownRequest {
            request_id: request_id.to_string(),
        };
        // A key that could never have been registered is simply unknown.
        let path = self.request_path(request_id).map_err(|_| unknown())?;

        match tokio::fs::read_to_string(&path).await {
            Ok(batch_id) => Ok(batch_id.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(unknown()),
            Err(e) => Err(CoreError::storage("resolve", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Outcome;
    use serde_json::json;

    async fn test_store() -> (tempfile::TempDir, FilePersistence) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FilePersistence::open(dir.path()).await.expect("open store");
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_read_write() {
        let (_dir, store) = test_store().await;
        let mut batch = Batch::open("b-1", "owner@example.com", 1);
        batch.track("r-1").unwrap();

        store.create(&batch, b"https://x/1\n").await.unwrap();
        assert_eq!(store.read("b-1").await.unwrap(), batch);
        assert_eq!(store.read_input("b-1").await.unwrap(), b"https://x/1\n");

        let err = store.create(&batch, b"").await.unwrap_err();
        assert!(matches!(err, CoreError::BatchAlreadyExists { .. }));

        batch
            .apply_resolution("r-1", Outcome::Success(json!({})))
            .unwrap();
        store.write(&batch).await.unwrap();
        assert_eq!(
            store.read("b-1").await.unwrap().status,
            BatchStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_missing_batch() {
        let (_dir, store) = test_store().await;
        assert!(matches!(
            store.read("nope").await,
            Err(CoreError::BatchNotFound { .. })
        ));
        assert!(matches!(
            store.write(&Batch::open("nope", "o", 1)).await,
            Err(CoreError::BatchNotFound { .. })
        ));
        assert!(matches!(
            store.append_result("nope", "r", &json!(1)).await,
            Err(CoreError::BatchNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_files() {
        let (dir, store) = test_store().await;
        let mut batch = Batch::open("b-1", "o", 3);
        store.create(&batch, b"").await.unwrap();
        for id in ["a", "b", "c"] {
            batch.track(id).unwrap();
            store.write(&batch).await.unwrap();
        }

        let names: Vec<String> = std::fs::read_dir(dir.path().join("batches/b-1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        let mut names = names;
        names.sort();
        assert_eq!(names, vec!["original.bin", "status.json"]);
    }

    #[tokio::test]
    async fn test_results_log_dedup_and_torn_tail() {
        let (dir, store) = test_store().await;
        store.create(&Batch::open("b-1", "o", 2), b"").await.unwrap();

        store.append_result("b-1", "r-1", &json!({"n": 1})).await.unwrap();
        store.append_result("b-1", "r-1", &json!({"n": 2})).await.unwrap();
        store.append_result("b-1", "r-2", &json!({"n": 3})).await.unwrap();

        // Simulate a crash mid-append.
        let log = dir.path().join("batches/b-1/results.jsonl");
        let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        file.write_all(b"\n{\"request_id\": \"r-3\", \"pay").unwrap();

        let results = store.read_results("b-1").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].payload, json!({"n": 1}));
        assert_eq!(results[1].request_id, "r-2");

        // Appending after the torn write still works.
        store.append_result("b-1", "r-3", &json!({"n": 4})).await.unwrap();
        let results = store.read_results("b-1").await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[2].payload, json!({"n": 4}));
    }

    #[tokio::test]
    async fn test_corrupt_results_line_is_reported() {
        let (dir, store) = test_store().await;
        store.create(&Batch::open("b-1", "o", 2), b"").await.unwrap();
        let log = dir.path().join("batches/b-1/results.jsonl");
        std::fs::write(&log, "not json\n{\"request_id\":\"r\",\"payload\":1,\"received_at\":\"2025-01-01T00:00:00Z\"}\n").unwrap();

        let err = store.read_results("b-1").await.unwrap_err();
        assert!(matches!(err, CoreError::CorruptRecord { .. }));
    }

    #[tokio::test]
    async fn test_request_index() {
        let (_dir, store) = test_store().await;

        store.register("r-1", "b-1").await.unwrap();
        store.register("r-1", "b-1").await.unwrap();
        assert_eq!(store.resolve("r-1").await.unwrap(), "b-1");

        let err = store.register("r-1", "b-2").await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));

        assert!(matches!(
            store.resolve("r-2").await,
            Err(CoreError::UnknownRequest { .. })
        ));
        assert!(matches!(
            store.resolve("../etc/passwd").await,
            Err(CoreError::UnknownRequest { .. })
        ));
        assert!(matches!(
            store.register("../escape", "b-1").await,
            Err(CoreError::ValidationError { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_skips_interrupted_creates() {
        let (dir, store) = test_store().await;
        store.create(&Batch::open("b-1", "o", 1), b"").await.unwrap();
        std::fs::create_dir(dir.path().join("batches/b-half")).unwrap();

        let listed = store.list_batches(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].batch_id, "b-1");
        assert!(
            store
                .list_batches(Some(BatchStatus::Complete))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("k", "20250101-abc_def.1").is_ok());
        assert!(validate_key("k", "").is_err());
        assert!(validate_key("k", ".hidden").is_err());
        assert!(validate_key("k", "a/b").is_err());
        assert!(validate_key("k", &"x".repeat(MAX_KEY_LEN + 1)).is_err());
    }
}
