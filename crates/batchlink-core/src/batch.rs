// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch record and its state machine.
//!
//! A batch moves one way, from `processing` to `complete`:
//!
//! ```text
//!     open(total_items)
//!            │
//!            ▼
//!     ┌────────────┐  track / reject / apply_resolution
//!     │ PROCESSING │◄──────────────────────────────────┐
//!     └─────┬──────┘───────────────────────────────────┘
//!           │ every item accounted for and pending empty,
//!           │ or force_complete
//!           ▼
//!     ┌────────────┐
//!     │  COMPLETE  │  (terminal, duplicates are no-ops)
//!     └────────────┘
//! ```
//!
//! Every item submitted to a batch is accounted for exactly once: either it
//! failed submission (an `errors` entry with stage `submission`), or its
//! request ID is pending, or its request ID was resolved (`received_count`).
//! The transition to `complete` happens on the single call that accounts for
//! the last item while leaving `pending` empty, and that call alone reports
//! [`Transition::Completed`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Requests are outstanding or items are still being submitted.
    Processing,
    /// Terminal.
    Complete,
}

impl BatchStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "processing" => Ok(Self::Processing),
            "complete" => Ok(Self::Complete),
            other => Err(CoreError::validation(
                "status",
                format!("unknown batch status '{}'", other),
            )),
        }
    }
}

/// Where an item failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    /// The provider rejected or errored on submission.
    Submission,
    /// The provider reported a failed resolution.
    Resolution,
    /// The batch was force-completed while the request was still pending.
    Timeout,
}

/// A per-item failure recorded on the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// The submitted identifier, or the request ID for resolution failures.
    pub item: String,
    /// Human-readable failure reason.
    pub error_reason: String,
    /// Stage at which the failure occurred.
    pub stage: ErrorStage,
}

/// A raw resolution payload keyed by its request ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    /// Request the payload resolved.
    pub request_id: String,
    /// Provider payload, stored verbatim.
    pub payload: serde_json::Value,
}

/// Outcome carried by a resolution report.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The request resolved with a payload.
    Success(serde_json::Value),
    /// The request failed with a reason.
    Failure(String),
}

/// Result of applying a mutation to a batch.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing changed; the record does not need to be written.
    Unchanged,
    /// The record changed but the batch did not complete.
    Updated,
    /// This call completed the batch.
    Completed,
}

impl Transition {
    /// Whether this call is the one that completed the batch.
    pub fn triggered_completion(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Durable per-batch state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Unique, time-derived batch identifier.
    pub batch_id: String,
    /// Destination for the terminal notification.
    pub owner_contact: String,
    /// Number of identifiers submitted.
    pub total_items: usize,
    /// Outstanding request IDs.
    pub pending: BTreeSet<String>,
    /// Resolutions applied so far (including failures and timeouts).
    pub received_count: usize,
    /// Per-item failures, in the order they were recorded.
    pub errors: Vec<ItemError>,
    /// Successful resolution payloads, in the order they were applied.
    pub results: Vec<ResultEntry>,
    /// Lifecycle status.
    pub status: BatchStatus,
    /// When the batch was opened.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
    /// When the batch completed.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the completion notification was delivered.
    #[serde(default)]
    pub notified_at: Option<DateTime<Utc>>,
    /// Failed notification attempts. Kept apart from `errors` so that item
    /// accounting is unaffected.
    #[serde(default)]
    pub notification_errors: Vec<String>,
}

/// Read-only summary view of a batch (no raw payloads).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Batch identifier.
    pub batch_id: String,
    /// Lifecycle status.
    pub status: BatchStatus,
    /// Number of identifiers submitted.
    pub total_items: usize,
    /// Resolutions applied so far.
    pub received_count: usize,
    /// Outstanding request count.
    pub pending_count: usize,
    /// Per-item failures.
    pub errors: Vec<ItemError>,
}

/// One-time signal emitted when a batch completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    /// The completed batch.
    pub batch_id: String,
    /// Where to send the notification.
    pub owner_contact: String,
    /// Number of identifiers submitted.
    pub total_items: usize,
    /// Successful resolution payloads.
    pub results: Vec<ResultEntry>,
    /// Per-item failures.
    pub errors: Vec<ItemError>,
}

/// Generate a fresh batch ID.
///
/// The prefix is the UTC timestamp down to microseconds so IDs sort by
/// creation time; the random suffix makes same-microsecond collisions
/// practically impossible.
pub fn new_batch_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%d%H%M%S%6f"),
        &suffix[..8]
    )
}

impl Batch {
    /// Open a batch for `total_items` identifiers, none accounted for yet.
    pub fn open(
        batch_id: impl Into<String>,
        owner_contact: impl Into<String>,
        total_items: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            batch_id: batch_id.into(),
            owner_contact: owner_contact.into(),
            total_items,
            pending: BTreeSet::new(),
            received_count: 0,
            errors: Vec::new(),
            results: Vec::new(),
            status: BatchStatus::Processing,
            created_at: now,
            updated_at: now,
            completed_at: None,
            notified_at: None,
            notification_errors: Vec::new(),
        }
    }

    /// Whether the batch reached its terminal state.
    pub fn is_complete(&self) -> bool {
        self.status == BatchStatus::Complete
    }

    /// Number of items that failed at submission time.
    pub fn submission_error_count(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| e.stage == ErrorStage::Submission)
            .count()
    }

    /// Items that have been submitted (successfully or not) so far.
    pub fn accounted_items(&self) -> usize {
        self.submission_error_count() + self.pending.len() + self.received_count
    }

    /// Register a successfully submitted request as pending.
    ///
    /// Tracking a request that is already pending is a no-op so retried
    /// submissions are harmless. So is tracking into a batch that was
    /// force-completed while the submission was in flight; the item stays
    /// unaccounted.
    pub fn track(&mut self, request_id: &str) -> Result<Transition> {
        if self.is_complete() || self.pending.contains(request_id) {
            return Ok(Transition::Unchanged);
        }
        self.ensure_room_for_item()?;
        self.pending.insert(request_id.to_string());
        self.touch();
        Ok(Transition::Updated)
    }

    /// Record an item whose submission failed.
    ///
    /// Completes the batch if this was the last item and nothing is pending.
    /// A no-op once the batch is complete.
    pub fn reject(&mut self, item: &str, reason: &str) -> Result<Transition> {
        if self.is_complete() {
            return Ok(Transition::Unchanged);
        }
        self.ensure_room_for_item()?;
        self.errors.push(ItemError {
            item: item.to_string(),
            error_reason: reason.to_string(),
            stage: ErrorStage::Submission,
        });
        Ok(self.settle())
    }

    /// Apply a resolution report.
    ///
    /// Fails with [`CoreError::AlreadyResolved`] when the request is not
    /// pending, which covers duplicate deliveries and reports arriving after
    /// completion. Returns [`Transition::Completed`] only on the call that
    /// empties the pending set of a fully submitted batch.
    pub fn apply_resolution(&mut self, request_id: &str, outcome: Outcome) -> Result<Transition> {
        if !self.pending.remove(request_id) {
            return Err(CoreError::AlreadyResolved {
                batch_id: self.batch_id.clone(),
                request_id: request_id.to_string(),
            });
        }

        self.received_count += 1;
        match outcome {
            Outcome::Success(payload) => self.results.push(ResultEntry {
                request_id: request_id.to_string(),
                payload,
            }),
            Outcome::Failure(reason) => self.errors.push(ItemError {
                item: request_id.to_string(),
                error_reason: reason,
                stage: ErrorStage::Resolution,
            }),
        }

        Ok(self.settle())
    }

    /// Resolve every pending request as a timeout failure and complete.
    ///
    /// Items whose submission never finished stay unaccounted; the batch
    /// completes regardless.
    pub fn force_complete(&mut self, reason: &str) -> Transition {
        if self.is_complete() {
            return Transition::Unchanged;
        }

        for request_id in std::mem::take(&mut self.pending) {
            self.received_count += 1;
            self.errors.push(ItemError {
                item: request_id,
                error_reason: reason.to_string(),
                stage: ErrorStage::Timeout,
            });
        }
        self.complete();
        Transition::Completed
    }

    /// Record that the completion notification was delivered.
    pub fn mark_notified(&mut self) -> Transition {
        if self.notified_at.is_some() {
            return Transition::Unchanged;
        }
        self.notified_at = Some(Utc::now());
        self.touch();
        Transition::Updated
    }

    /// Record a failed notification attempt. The batch stays complete.
    pub fn record_notification_failure(&mut self, reason: &str) -> Transition {
        self.notification_errors.push(reason.to_string());
        self.touch();
        Transition::Updated
    }

    /// Summary view for polling.
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            batch_id: self.batch_id.clone(),
            status: self.status,
            total_items: self.total_items,
            received_count: self.received_count,
            pending_count: self.pending.len(),
            errors: self.errors.clone(),
        }
    }

    /// Completion event for this batch.
    pub fn completion_event(&self) -> CompletionEvent {
        CompletionEvent {
            batch_id: self.batch_id.clone(),
            owner_contact: self.owner_contact.clone(),
            total_items: self.total_items,
            results: self.results.clone(),
            errors: self.errors.clone(),
        }
    }

    /// Check the structural invariants of a decoded record.
    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if self.batch_id.is_empty() {
            return Err("batch_id is empty".to_string());
        }
        if self.is_complete() && !self.pending.is_empty() {
            return Err(format!(
                "complete batch has {} pending requests",
                self.pending.len()
            ));
        }
        if self.accounted_items() > self.total_items {
            return Err(format!(
                "{} items accounted for but only {} submitted",
                self.accounted_items(),
                self.total_items
            ));
        }
        Ok(())
    }

    fn ensure_room_for_item(&self) -> Result<()> {
        if self.is_complete() || self.accounted_items() >= self.total_items {
            return Err(CoreError::validation(
                "items",
                format!(
                    "batch '{}' already accounts for all {} items",
                    self.batch_id, self.total_items
                ),
            ));
        }
        Ok(())
    }

    fn settle(&mut self) -> Transition {
        if self.pending.is_empty() && self.accounted_items() == self.total_items {
            self.complete();
            Transition::Completed
        } else {
            self.touch();
            Transition::Updated
        }
    }

    fn complete(&mut self) {
        let now = Utc::now();
        self.status = BatchStatus::Complete;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submitted(total: usize, request_ids: &[&str]) -> Batch {
        let mut batch = Batch::open("b-1", "owner@example.com", total);
        for id in request_ids {
            assert_eq!(batch.track(id).unwrap(), Transition::Updated);
        }
        batch
    }

    #[test]
    fn test_resolving_all_requests_completes_once() {
        let mut batch = submitted(3, &["a", "b", "c"]);

        let transitions: Vec<Transition> = ["c", "a", "b"]
            .iter()
            .map(|id| {
                batch
                    .apply_resolution(id, Outcome::Success(json!({ "id": id })))
                    .unwrap()
            })
            .collect();

        assert_eq!(
            transitions,
            vec![
                Transition::Updated,
                Transition::Updated,
                Transition::Completed
            ]
        );
        assert!(batch.is_complete());
        assert_eq!(batch.received_count, 3);
        assert_eq!(batch.results.len(), 3);
        assert_eq!(batch.results[0].request_id, "c");
        assert!(batch.completed_at.is_some());
    }

    #[test]
    fn test_duplicate_resolution_is_rejected_without_side_effects() {
        let mut batch = submitted(2, &["a", "b"]);

        let first = batch
            .apply_resolution("a", Outcome::Success(json!(1)))
            .unwrap();
        assert_eq!(first, Transition::Updated);

        let err = batch
            .apply_resolution("a", Outcome::Success(json!(2)))
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyResolved { .. }));
        assert_eq!(batch.received_count, 1);
        assert_eq!(batch.results.len(), 1);
        assert_eq!(batch.pending, BTreeSet::from(["b".to_string()]));
    }

    #[test]
    fn test_duplicate_after_completion_does_not_reopen() {
        let mut batch = submitted(1, &["a"]);
        assert!(
            batch
                .apply_resolution("a", Outcome::Success(json!({})))
                .unwrap()
                .triggered_completion()
        );

        let err = batch
            .apply_resolution("a", Outcome::Failure("late".to_string()))
            .unwrap_err();
        assert!(err.is_benign());
        assert!(batch.is_complete());
        assert!(batch.errors.is_empty());
    }

    #[test]
    fn test_all_submissions_failed_completes_on_last_reject() {
        let mut batch = Batch::open("b-2", "owner@example.com", 2);

        assert_eq!(
            batch.reject("https://x/1", "HTTP 500").unwrap(),
            Transition::Updated
        );
        assert_eq!(
            batch.reject("https://x/2", "timeout").unwrap(),
            Transition::Completed
        );
        assert!(batch.is_complete());
        assert!(batch.pending.is_empty());
        assert_eq!(batch.submission_error_count(), 2);
    }

    #[test]
    fn test_early_resolution_does_not_complete_partially_submitted_batch() {
        let mut batch = Batch::open("b-3", "owner@example.com", 2);
        batch.track("a").unwrap();

        // Callback for the first item arrives before the second is submitted.
        let transition = batch
            .apply_resolution("a", Outcome::Success(json!({})))
            .unwrap();
        assert_eq!(transition, Transition::Updated);
        assert!(!batch.is_complete());

        // The last item fails submission, which now completes the batch.
        assert_eq!(
            batch.reject("item-2", "rejected").unwrap(),
            Transition::Completed
        );
    }

    #[test]
    fn test_mixed_scenario_accounting() {
        // 3 items: 2 submitted, 1 failed submission.
        let mut batch = Batch::open("b-4", "owner@example.com", 3);
        batch.track("r1").unwrap();
        batch.reject("bad-url", "invalid identifier").unwrap();
        batch.track("r2").unwrap();
        assert_eq!(batch.pending.len(), 2);
        assert_eq!(batch.errors.len(), 1);

        batch
            .apply_resolution("r2", Outcome::Success(json!({"n": 2})))
            .unwrap();
        let last = batch
            .apply_resolution("r1", Outcome::Success(json!({"n": 1})))
            .unwrap();

        assert!(last.triggered_completion());
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.results.len(), 2);
        assert_eq!(
            batch.received_count + batch.submission_error_count(),
            batch.total_items
        );
    }

    #[test]
    fn test_resolution_failure_is_recorded() {
        let mut batch = submitted(1, &["a"]);
        batch
            .apply_resolution("a", Outcome::Failure("no match".to_string()))
            .unwrap();

        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].stage, ErrorStage::Resolution);
        assert_eq!(batch.errors[0].error_reason, "no match");
        assert!(batch.results.is_empty());
        assert!(batch.is_complete());
    }

    #[test]
    fn test_track_is_idempotent_and_bounded() {
        let mut batch = submitted(1, &["a"]);
        assert_eq!(batch.track("a").unwrap(), Transition::Unchanged);

        let err = batch.track("b").unwrap_err();
        assert!(matches!(err, CoreError::ValidationError { .. }));
        let err = batch.reject("c", "x").unwrap_err();
        assert!(matches!(err, CoreError::ValidationError { .. }));
    }

    #[test]
    fn test_force_complete_times_out_pending() {
        let mut batch = submitted(3, &["a", "b", "c"]);
        batch
            .apply_resolution("b", Outcome::Success(json!({})))
            .unwrap();

        let transition = batch.force_complete("no callback within 3600s");
        assert_eq!(transition, Transition::Completed);
        assert!(batch.is_complete());
        assert!(batch.pending.is_empty());
        assert_eq!(batch.received_count, 3);
        let timeouts: Vec<&str> = batch
            .errors
            .iter()
            .filter(|e| e.stage == ErrorStage::Timeout)
            .map(|e| e.item.as_str())
            .collect();
        assert_eq!(timeouts, vec!["a", "c"]);

        assert_eq!(batch.force_complete("again"), Transition::Unchanged);
    }

    #[test]
    fn test_submission_after_force_complete_is_ignored() {
        let mut batch = submitted(3, &["a"]);
        assert_eq!(batch.force_complete("stale"), Transition::Completed);

        assert_eq!(batch.track("b").unwrap(), Transition::Unchanged);
        assert_eq!(batch.reject("c", "HTTP 500").unwrap(), Transition::Unchanged);
        assert!(batch.pending.is_empty());
        assert_eq!(batch.accounted_items(), 1);
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn test_notification_bookkeeping() {
        let mut batch = submitted(1, &["a"]);
        batch
            .apply_resolution("a", Outcome::Success(json!({})))
            .unwrap();

        assert_eq!(
            batch.record_notification_failure("smtp down"),
            Transition::Updated
        );
        assert!(batch.is_complete());
        assert_eq!(batch.notification_errors, vec!["smtp down".to_string()]);
        assert!(batch.errors.is_empty());

        assert_eq!(batch.mark_notified(), Transition::Updated);
        assert_eq!(batch.mark_notified(), Transition::Unchanged);
    }

    #[test]
    fn test_summary_has_no_payloads() {
        let mut batch = submitted(2, &["a", "b"]);
        batch
            .apply_resolution("a", Outcome::Success(json!({"secret": true})))
            .unwrap();

        let summary = batch.summary();
        assert_eq!(summary.status, BatchStatus::Processing);
        assert_eq!(summary.total_items, 2);
        assert_eq!(summary.received_count, 1);
        assert_eq!(summary.pending_count, 1);

        let rendered = serde_json::to_value(&summary).unwrap();
        assert!(rendered.get("results").is_none());
        assert_eq!(rendered["status"], "processing");
    }

    #[test]
    fn test_record_field_names() {
        let batch = submitted(1, &["a"]);
        let value = serde_json::to_value(&batch).unwrap();
        for field in [
            "batch_id",
            "owner_contact",
            "total_items",
            "pending",
            "received_count",
            "errors",
            "results",
            "status",
        ] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
    }

    #[test]
    fn test_validate_rejects_inconsistent_records() {
        let mut batch = submitted(1, &["a"]);
        batch.status = BatchStatus::Complete;
        assert!(batch.validate().is_err());

        let mut batch = Batch::open("b", "o", 0);
        batch.pending.insert("x".to_string());
        assert!(batch.validate().is_err());

        assert!(submitted(2, &["a"]).validate().is_ok());
    }

    #[test]
    fn test_batch_ids_are_unique_and_sortable() {
        let a = new_batch_id();
        let b = new_batch_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 20 + 1 + 8);
        assert!(a[..20] <= b[..20]);
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!(
            "processing".parse::<BatchStatus>().unwrap(),
            BatchStatus::Processing
        );
        assert_eq!(BatchStatus::Complete.to_string(), "complete");
        assert!("done".parse::<BatchStatus>().is_err());
    }
}
