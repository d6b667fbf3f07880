// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrent resolution delivery: exactly one caller observes completion.

mod common;

use std::sync::Arc;

use serde_json::json;

use batchlink_core::{CorrelationService, Outcome, Resolved};
use common::{ScriptedSubmitter, file_service, items, request_id, sqlite_service};

/// Fire every resolution (each delivered twice) at once and count completions.
async fn race_resolutions(service: Arc<CorrelationService>, concurrency: usize) {
    let started = service
        .begin_batch(
            "owner@example.com",
            items(concurrency),
            b"",
            &ScriptedSubmitter::new(),
        )
        .await
        .unwrap();

    let mut handles = Vec::new();
    for item in items(concurrency).into_iter().chain(items(concurrency)) {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .handle_resolution(&request_id(&item), Outcome::Success(json!({"item": item})))
                .await
        }));
    }

    let mut completed = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Resolved::Completed(event) => {
                completed += 1;
                assert_eq!(event.results.len(), concurrency);
            }
            Resolved::Duplicate { .. } => duplicates += 1,
            Resolved::Pending { .. } => {}
        }
    }

    assert_eq!(completed, 1, "exactly one caller triggers completion");
    assert_eq!(duplicates, concurrency);

    let batch = service.query_status(&started.batch_id).await.unwrap();
    assert!(batch.is_complete());
    assert!(batch.pending.is_empty());
    assert_eq!(batch.received_count, concurrency);
    assert_eq!(batch.results.len(), concurrency);
    assert_eq!(
        service.results(&started.batch_id).await.unwrap().len(),
        concurrency
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolutions_complete_once_sqlite() {
    race_resolutions(Arc::new(sqlite_service().await), 24).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolutions_complete_once_file() {
    let dir = tempfile::tempdir().unwrap();
    race_resolutions(Arc::new(file_service(dir.path()).await), 24).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batches_progress_independently() {
    let service = Arc::new(sqlite_service().await);
    let submitter = ScriptedSubmitter::new();

    let first = service
        .begin_batch("a@example.com", vec!["a0".into(), "a1".into()], b"", &submitter)
        .await
        .unwrap();
    let second = service
        .begin_batch("b@example.com", vec!["b0".into()], b"", &submitter)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for item in ["a0", "a1", "b0"] {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .handle_resolution(&request_id(item), Outcome::Failure("not found".into()))
                .await
                .unwrap()
        }));
    }

    let mut completed = Vec::new();
    for handle in handles {
        if let Some(event) = handle.await.unwrap().into_completion() {
            completed.push(event.batch_id);
        }
    }
    completed.sort();
    let mut expected = vec![first.batch_id, second.batch_id];
    expected.sort();
    assert_eq!(completed, expected);
}
