// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation service: the single owner of batch and index mutation.
//!
//! Ties the [`RecordStore`], the [`RequestIndex`] and the batch state machine
//! together. Every read-modify-write of a batch record runs under that
//! batch's lock; external calls (submissions, notifications) never do.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{Span, debug, error, info, instrument, warn};

use crate::batch::{
    Batch, BatchStatus, BatchSummary, CompletionEvent, ErrorStage, Outcome, ResultEntry,
    Transition, new_batch_id,
};
use crate::error::{CoreError, Result};
use crate::locks::{BatchLocks, DeliveryClaim, DeliveryClaims};
use crate::persistence::{RecordStore, RequestIndex};

/// Default number of in-flight submissions per batch.
pub const DEFAULT_SUBMIT_CONCURRENCY: usize = 8;

/// A provider rejected or errored on one identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct SubmissionFailure {
    /// Why the submission failed.
    pub reason: String,
}

impl SubmissionFailure {
    /// Create a failure with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// External enrichment submission collaborator.
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Submit one identifier and return the provider's opaque request token.
    async fn submit(&self, item: &str) -> std::result::Result<String, SubmissionFailure>;
}

/// Result of [`CorrelationService::begin_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStarted {
    /// The new batch.
    pub batch_id: String,
    /// Items with a registered request.
    pub submitted: usize,
    /// Items that failed submission.
    pub failed: usize,
    /// Set when no request was outstanding once submission finished, so the
    /// batch completed synchronously.
    pub completion: Option<CompletionEvent>,
}

/// Result of [`CorrelationService::handle_resolution`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// Applied; the batch is still waiting on other requests.
    Pending {
        /// Owning batch.
        batch_id: String,
        /// Requests still outstanding.
        remaining: usize,
    },
    /// Applied, and this report completed the batch.
    Completed(CompletionEvent),
    /// The request was already resolved; nothing changed.
    Duplicate {
        /// Owning batch.
        batch_id: String,
    },
}

impl Resolved {
    /// The batch the report belonged to.
    pub fn batch_id(&self) -> &str {
        match self {
            Self::Pending { batch_id, .. } | Self::Duplicate { batch_id } => batch_id,
            Self::Completed(event) => &event.batch_id,
        }
    }

    /// The completion event, if this report triggered one.
    pub fn into_completion(self) -> Option<CompletionEvent> {
        match self {
            Self::Completed(event) => Some(event),
            _ => None,
        }
    }
}

/// Façade over the record store, request index and batch state machine.
pub struct CorrelationService {
    records: Arc<dyn RecordStore>,
    index: Arc<dyn RequestIndex>,
    locks: BatchLocks,
    deliveries: DeliveryClaims,
    submit_concurrency: usize,
}

impl CorrelationService {
    /// Create a service over explicit store handles.
    pub fn new(records: Arc<dyn RecordStore>, index: Arc<dyn RequestIndex>) -> Self {
        Self {
            records,
            index,
            locks: BatchLocks::new(),
            deliveries: DeliveryClaims::new(),
            submit_concurrency: DEFAULT_SUBMIT_CONCURRENCY,
        }
    }

    /// Create a service over a backend that implements both stores.
    pub fn from_backend<P>(backend: Arc<P>) -> Self
    where
        P: RecordStore + RequestIndex + 'static,
    {
        Self::new(backend.clone(), backend)
    }

    /// Bound the number of concurrent submissions per batch.
    pub fn with_submit_concurrency(mut self, concurrency: usize) -> Self {
        self.submit_concurrency = concurrency.max(1);
        self
    }

    /// Open a batch and submit every item to the provider.
    ///
    /// Items are submitted concurrently; each one is registered (or recorded
    /// as a submission failure) as soon as its own submission returns, so a
    /// slow item never delays the others. Per-item failures are absorbed into
    /// the batch. Index conflicts and store failures abort the call.
    #[instrument(
        skip(self, items, original_input, submitter),
        fields(items = items.len(), batch_id = tracing::field::Empty)
    )]
    pub async fn begin_batch(
        &self,
        owner_contact: &str,
        items: Vec<String>,
        original_input: &[u8],
        submitter: &dyn Submitter,
    ) -> Result<BatchStarted> {
        let owner_contact = owner_contact.trim();
        if owner_contact.is_empty() {
            return Err(CoreError::validation("owner_contact", "is required"));
        }
        if items.is_empty() {
            return Err(CoreError::validation("items", "at least one item is required"));
        }

        let batch = Batch::open(new_batch_id(), owner_contact, items.len());
        let batch_id = batch.batch_id.clone();
        Span::current().record("batch_id", batch_id.as_str());

        self.records.create(&batch, original_input).await?;
        info!(total_items = batch.total_items, "Batch opened");

        // Items not yet accounted for in the record, by name.
        let mut unaccounted: HashMap<String, usize> = HashMap::new();
        for item in &items {
            *unaccounted.entry(item.clone()).or_default() += 1;
        }

        let mut submissions = stream::iter(items)
            .map(|item| async move {
                let outcome = submitter.submit(&item).await;
                (item, outcome)
            })
            .buffer_unordered(self.submit_concurrency);

        let mut seen = HashSet::new();
        let mut started = BatchStarted {
            batch_id: batch_id.clone(),
            submitted: 0,
            failed: 0,
            completion: None,
        };

        while let Some((item, outcome)) = submissions.next().await {
            let outcome = outcome.and_then(|request_id| {
                let request_id = request_id.trim().to_string();
                if request_id.is_empty() {
                    Err(SubmissionFailure::new("provider returned an empty request id"))
                } else if !seen.insert(request_id.clone()) {
                    Err(SubmissionFailure::new(format!(
                        "provider returned request id '{}' for more than one item",
                        request_id
                    )))
                } else {
                    Ok(request_id)
                }
            });

            // Registration and tracking share the lock so a callback that finds
            // the index entry always finds the request pending.
            let guard = self.locks.lock(&batch_id).await;

            let accounted: Result<(Batch, Transition)> = async {
                // An unusable token is the item's failure; a conflict is not.
                let outcome = match outcome {
                    Ok(request_id) => match self.index.register(&request_id, &batch_id).await {
                        Ok(()) => Ok(request_id),
                        Err(CoreError::ValidationError { message, .. }) => {
                            Err(SubmissionFailure::new(message))
                        }
                        Err(e) => {
                            error!(request_id = %request_id, error = %e, "Request registration failed");
                            return Err(e);
                        }
                    },
                    Err(failure) => Err(failure),
                };

                match outcome {
                    Ok(request_id) => {
                        debug!(item = %item, request_id = %request_id, "Item submitted");
                        started.submitted += 1;
                        self.mutate_locked(&batch_id, |b| b.track(&request_id)).await
                    }
                    Err(failure) => {
                        warn!(item = %item, reason = %failure, "Item submission failed");
                        started.failed += 1;
                        self.mutate_locked(&batch_id, |b| b.reject(&item, &failure.reason))
                            .await
                    }
                }
            }
            .await;

            let (batch, transition) = match accounted {
                Ok(accounted) => accounted,
                Err(e) => {
                    let remaining = unaccounted
                        .into_iter()
                        .flat_map(|(item, count)| std::iter::repeat_n(item, count))
                        .collect();
                    self.abort_submission(&batch_id, remaining, &e).await;
                    return Err(e);
                }
            };
            drop(guard);

            if let Some(count) = unaccounted.get_mut(&item) {
                *count -= 1;
                if *count == 0 {
                    unaccounted.remove(&item);
                }
            }

            if transition.triggered_completion() {
                info!(
                    failed = started.failed,
                    "Batch completed during submission"
                );
                started.completion = Some(batch.completion_event());
            } else if transition == Transition::Unchanged && batch.is_complete() {
                debug!(item = %item, "Batch already complete; submission not recorded");
            }
        }

        info!(
            submitted = started.submitted,
            failed = started.failed,
            "Batch submission finished"
        );
        Ok(started)
    }

    /// Apply one resolution report.
    ///
    /// Unknown request IDs fail with [`CoreError::UnknownRequest`] without
    /// touching any batch. Duplicates (including reports arriving after
    /// completion) return [`Resolved::Duplicate`]. Only the report that
    /// completes the batch returns [`Resolved::Completed`].
    #[instrument(skip(self, outcome), fields(batch_id = tracing::field::Empty))]
    pub async fn handle_resolution(&self, request_id: &str, outcome: Outcome) -> Result<Resolved> {
        let batch_id = self.index.resolve(request_id).await.inspect_err(|e| {
            if e.is_benign() {
                warn!("Discarding resolution for unknown request");
            }
        })?;
        Span::current().record("batch_id", batch_id.as_str());

        // The log append and the state change share the lock, and only a
        // report for a still-pending request reaches the log.
        let _guard = self.locks.lock(&batch_id).await;
        if let Outcome::Success(payload) = &outcome {
            let batch = self.records.read(&batch_id).await?;
            if batch.pending.contains(request_id) {
                self.records
                    .append_result(&batch_id, request_id, payload)
                    .await?;
            }
        }

        match self
            .mutate_locked(&batch_id, |b| b.apply_resolution(request_id, outcome))
            .await
        {
            Ok((batch, Transition::Completed)) => {
                info!(
                    received = batch.received_count,
                    errors = batch.errors.len(),
                    "Batch complete"
                );
                Ok(Resolved::Completed(batch.completion_event()))
            }
            Ok((batch, _)) => {
                debug!(remaining = batch.pending.len(), "Resolution applied");
                Ok(Resolved::Pending {
                    batch_id,
                    remaining: batch.pending.len(),
                })
            }
            Err(CoreError::AlreadyResolved { .. }) => {
                warn!("Duplicate resolution ignored");
                Ok(Resolved::Duplicate { batch_id })
            }
            Err(e) => Err(e),
        }
    }

    /// Current record of a batch.
    pub async fn query_status(&self, batch_id: &str) -> Result<Batch> {
        self.records.read(batch_id).await
    }

    /// Summary view of a batch (no raw payloads).
    pub async fn summary(&self, batch_id: &str) -> Result<BatchSummary> {
        Ok(self.records.read(batch_id).await?.summary())
    }

    /// Raw results log of a batch, in arrival order.
    ///
    /// Only entries for requests the record counts as received are returned;
    /// a log line written just before a crash that lost the record update is
    /// dropped.
    pub async fn results(&self, batch_id: &str) -> Result<Vec<ResultEntry>> {
        let batch = self.records.read(batch_id).await?;
        let received: HashSet<&str> = batch.results.iter().map(|r| r.request_id.as_str()).collect();
        let mut entries = self.records.read_results(batch_id).await?;
        entries.retain(|entry| received.contains(entry.request_id.as_str()));
        Ok(entries)
    }

    /// The original input artifact of a batch, verbatim.
    pub async fn original_input(&self, batch_id: &str) -> Result<Vec<u8>> {
        self.records.read_input(batch_id).await
    }

    /// The batch that owns a request.
    pub async fn batch_for_request(&self, request_id: &str) -> Result<String> {
        self.index.resolve(request_id).await
    }

    /// Claim the right to deliver the completion notice of a batch.
    ///
    /// `None` while another delivery for the batch is in flight in this
    /// process. The claim is released when dropped.
    pub fn claim_delivery(&self, batch_id: &str) -> Option<DeliveryClaim> {
        self.deliveries.claim(batch_id)
    }

    /// Record that the completion notification for a batch was delivered.
    pub async fn mark_notified(&self, batch_id: &str) -> Result<()> {
        self.mutate(batch_id, |b| Ok(b.mark_notified())).await?;
        Ok(())
    }

    /// Record a failed notification. The batch stays complete.
    pub async fn record_notification_failure(&self, batch_id: &str, reason: &str) -> Result<()> {
        self.mutate(batch_id, |b| Ok(b.record_notification_failure(reason)))
            .await?;
        Ok(())
    }

    /// Force-complete processing batches with no activity for `stale_after`.
    ///
    /// Remaining pending requests are recorded as timeout errors. Returns the
    /// completion events of the batches this call completed.
    pub async fn expire_stale(&self, stale_after: Duration) -> Result<Vec<CompletionEvent>> {
        let cutoff = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reason = format!(
            "no resolution received within {}s of inactivity",
            stale_after.as_secs()
        );

        let mut events = Vec::new();
        for listing in self
            .records
            .list_batches(Some(BatchStatus::Processing))
            .await?
        {
            if listing.updated_at > cutoff {
                continue;
            }

            // Re-check under the lock: a resolution may have landed since listing.
            let expired = self
                .mutate(&listing.batch_id, |b| {
                    if b.is_complete() || b.updated_at > cutoff {
                        Ok(Transition::Unchanged)
                    } else {
                        Ok(b.force_complete(&reason))
                    }
                })
                .await;

            match expired {
                Ok((batch, Transition::Completed)) => {
                    warn!(
                        batch_id = %batch.batch_id,
                        timed_out = batch
                            .errors
                            .iter()
                            .filter(|e| e.stage == ErrorStage::Timeout)
                            .count(),
                        "Stale batch force-completed"
                    );
                    events.push(batch.completion_event());
                }
                Ok(_) => {}
                Err(e) => {
                    error!(batch_id = %listing.batch_id, error = %e, "Failed to expire stale batch");
                }
            }
        }

        Ok(events)
    }

    /// Completion events of batches that completed at or before
    /// `completed_before`, were never marked notified, and have fewer than
    /// `max_failures` failed notification attempts.
    pub async fn unnotified_completions(
        &self,
        completed_before: DateTime<Utc>,
        max_failures: usize,
    ) -> Result<Vec<CompletionEvent>> {
        let mut events = Vec::new();
        for listing in self
            .records
            .list_batches(Some(BatchStatus::Complete))
            .await?
        {
            let due = listing
                .completed_at
                .is_some_and(|at| at <= completed_before);
            if listing.notified || !due {
                continue;
            }
            let batch = self.records.read(&listing.batch_id).await?;
            if batch.notification_errors.len() >= max_failures {
                continue;
            }
            events.push(batch.completion_event());
        }
        Ok(events)
    }

    /// Record every item whose submission never got accounted for as a
    /// submission failure, so an aborted `begin_batch` cannot leave the batch
    /// processing forever. Caller holds the batch lock.
    ///
    /// If this completes the batch, the completion is left for
    /// [`Self::unnotified_completions`] to pick up.
    async fn abort_submission(&self, batch_id: &str, remaining: Vec<String>, cause: &CoreError) {
        let reason = format!("submission aborted: {}", cause);
        let aborted = self
            .mutate_locked(batch_id, |b| {
                let mut transition = Transition::Unchanged;
                for item in &remaining {
                    match b.reject(item, &reason)? {
                        Transition::Unchanged => {}
                        Transition::Updated => transition = Transition::Updated,
                        Transition::Completed => return Ok(Transition::Completed),
                    }
                }
                Ok(transition)
            })
            .await;

        match aborted {
            Ok((batch, transition)) => warn!(
                batch_id,
                rejected = remaining.len(),
                complete = batch.is_complete(),
                completed_now = transition.triggered_completion(),
                "Batch submission aborted"
            ),
            Err(e) => error!(
                batch_id,
                error = %e,
                "Failed to record aborted submission; batch stays processing until it expires"
            ),
        }
    }

    /// Read-modify-write one batch under its lock.
    ///
    /// The record is only written when `apply` reports a change.
    async fn mutate<F>(&self, batch_id: &str, apply: F) -> Result<(Batch, Transition)>
    where
        F: FnOnce(&mut Batch) -> Result<Transition>,
    {
        let _guard = self.locks.lock(batch_id).await;
        self.mutate_locked(batch_id, apply).await
    }

    /// [`Self::mutate`] for callers already holding the batch lock.
    async fn mutate_locked<F>(&self, batch_id: &str, apply: F) -> Result<(Batch, Transition)>
    where
        F: FnOnce(&mut Batch) -> Result<Transition>,
    {
        let mut batch = self.records.read(batch_id).await?;
        let transition = apply(&mut batch)?;
        if transition != Transition::Unchanged {
            self.records.write(&batch).await?;
        }
        Ok((batch, transition))
    }
}
