// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background sweeper for stale batches and undelivered completions.
//!
//! Periodically:
//! 1. force-completes processing batches that saw no activity for
//!    `stale_after` (when configured), delivering their completion events;
//! 2. re-delivers completion events of batches that completed more than
//!    `notify_grace` ago but were never marked notified, which covers a
//!    crash between durable completion and notification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::batch::CompletionEvent;
use crate::correlation::CorrelationService;
use crate::error::Result;

/// A completion notification could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DeliveryError(pub String);

/// Receiver of completion events (email, webhook, log, ...).
#[async_trait]
pub trait CompletionSink: Send + Sync {
    /// Deliver one completion event.
    async fn deliver(&self, event: &CompletionEvent) -> std::result::Result<(), DeliveryError>;
}

/// What [`deliver_completion`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The sink accepted the event and the batch is marked notified.
    Delivered,
    /// The sink failed; the failure is recorded on the batch.
    Failed,
    /// Another delivery is in flight, or the batch is already notified.
    Skipped,
}

/// Deliver a completion event and record the outcome on the batch.
///
/// At most one delivery per batch runs at a time in this process. Delivery
/// failures are recorded on the batch and never change its status.
pub async fn deliver_completion(
    service: &CorrelationService,
    sink: &dyn CompletionSink,
    event: &CompletionEvent,
) -> Result<DeliveryOutcome> {
    let Some(_claim) = service.claim_delivery(&event.batch_id) else {
        debug!(batch_id = %event.batch_id, "Delivery already in flight");
        return Ok(DeliveryOutcome::Skipped);
    };
    // The event may predate a delivery that finished before the claim.
    if service
        .query_status(&event.batch_id)
        .await?
        .notified_at
        .is_some()
    {
        debug!(batch_id = %event.batch_id, "Batch already notified");
        return Ok(DeliveryOutcome::Skipped);
    }

    match sink.deliver(event).await {
        Ok(()) => {
            service.mark_notified(&event.batch_id).await?;
            info!(batch_id = %event.batch_id, "Completion notification delivered");
            Ok(DeliveryOutcome::Delivered)
        }
        Err(e) => {
            warn!(batch_id = %event.batch_id, error = %e, "Completion notification failed");
            service
                .record_notification_failure(&event.batch_id, &e.0)
                .await?;
            Ok(DeliveryOutcome::Failed)
        }
    }
}

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Inactivity after which a processing batch is force-completed.
    /// `None` disables expiry.
    pub stale_after: Option<Duration>,
    /// How long a completed batch may stay unnotified before redelivery.
    pub notify_grace: Duration,
    /// Failed notification attempts after which a batch is left alone.
    pub max_delivery_attempts: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            stale_after: None,
            notify_grace: Duration::from_secs(60),
            max_delivery_attempts: 5,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Batches force-completed by this sweep.
    pub expired: usize,
    /// Notifications delivered by this sweep.
    pub delivered: usize,
    /// Notifications that failed in this sweep.
    pub failed: usize,
}

/// Sweeper that runs as a background task.
pub struct Sweeper {
    service: Arc<CorrelationService>,
    sink: Arc<dyn CompletionSink>,
    config: SweeperConfig,
    shutdown: Arc<Notify>,
}

impl Sweeper {
    /// Create a new sweeper.
    pub fn new(
        service: Arc<CorrelationService>,
        sink: Arc<dyn CompletionSink>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            service,
            sink,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            stale_after_secs = self.config.stale_after.map(|d| d.as_secs()),
            "Sweeper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.sweep_once().await {
                        Ok(report) if report != SweepReport::default() => {
                            info!(
                                expired = report.expired,
                                delivered = report.delivered,
                                failed = report.failed,
                                "Sweep finished"
                            );
                        }
                        Ok(_) => debug!("Nothing to sweep"),
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
            }
        }
    }

    /// Run a single sweep.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        if let Some(stale_after) = self.config.stale_after {
            let expired = self.service.expire_stale(stale_after).await?;
            report.expired = expired.len();
            for event in &expired {
                self.deliver(event, &mut report).await;
            }
        }

        let grace = chrono::Duration::from_std(self.config.notify_grace)
            .unwrap_or(chrono::Duration::zero());
        let completed_before = Utc::now()
            .checked_sub_signed(grace)
            .unwrap_or_else(Utc::now);
        for event in self
            .service
            .unnotified_completions(completed_before, self.config.max_delivery_attempts)
            .await?
        {
            info!(batch_id = %event.batch_id, "Redelivering completion notification");
            self.deliver(&event, &mut report).await;
        }

        Ok(report)
    }

    async fn deliver(&self, event: &CompletionEvent, report: &mut SweepReport) {
        match deliver_completion(&self.service, self.sink.as_ref(), event).await {
            Ok(DeliveryOutcome::Delivered) => report.delivered += 1,
            Ok(DeliveryOutcome::Failed) => report.failed += 1,
            Ok(DeliveryOutcome::Skipped) => {}
            Err(e) => {
                // Continue with the other batches.
                error!(batch_id = %event.batch_id, error = %e, "Failed to record delivery outcome");
                report.failed += 1;
            }
        }
    }
}
