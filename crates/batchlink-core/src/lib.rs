// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batchlink Core - Batch Correlation and Completion Detection
//!
//! This crate tracks batches of identifiers fanned out to an asynchronous
//! enrichment provider, correlates the provider's out-of-band resolution
//! reports back to their batch, and detects the exact moment a batch is
//! finished.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌─────────────────────────────────────┐
//! │   Upload handler     │        │   Callback handler (many, parallel) │
//! └──────────┬───────────┘        └──────────────────┬──────────────────┘
//!            │ begin_batch                           │ handle_resolution
//!            ▼                                       ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        CorrelationService                           │
//! │   per-batch locks ─► read ─► Batch state machine ─► atomic write    │
//! └──────────┬───────────────────────┬───────────────────────┬──────────┘
//!            │                       │                       │
//!            ▼                       ▼                       ▼
//! ┌────────────────────┐  ┌────────────────────┐  ┌────────────────────┐
//! │    RecordStore     │  │    RequestIndex    │  │      Sweeper       │
//! │ records, input,    │  │ request → batch    │  │ stale expiry,      │
//! │ raw results log    │  │                    │  │ redelivery         │
//! └────────────────────┘  └────────────────────┘  └────────────────────┘
//!            │                       │
//!            └──────────┬────────────┘
//!                       ▼
//!          SQLite  or  plain files (atomic rename)
//! ```
//!
//! # Guarantees
//!
//! | Property | How |
//! |----------|-----|
//! | No lost updates | Every record read-modify-write holds that batch's lock |
//! | Exactly one completion | Only the transition that empties `pending` of a fully submitted batch reports `Completed` |
//! | Idempotent callbacks | Resolving a request that is not pending is a no-op |
//! | Crash safety | Record writes are atomic; completion is durable before it is reported |
//! | No cross-batch contention | Locks are keyed by batch ID |
//!
//! # Modules
//!
//! - [`batch`]: batch record, state machine and completion events
//! - [`correlation`]: the service façade and the [`Submitter`] seam
//! - [`persistence`]: [`RecordStore`] / [`RequestIndex`] with SQLite and file backends
//! - [`locks`]: per-batch mutual exclusion
//! - [`sweeper`]: background expiry and notification redelivery
//! - [`error`]: error types

#![deny(missing_docs)]

/// Batch record, state machine and completion events.
pub mod batch;
/// Correlation service façade.
pub mod correlation;
/// Error types.
pub mod error;
/// Per-batch locks.
pub mod locks;
/// Embedded database migrations.
pub mod migrations;
/// Persistence interfaces and backends.
pub mod persistence;
/// Background sweeper.
pub mod sweeper;

pub use batch::{
    Batch, BatchStatus, BatchSummary, CompletionEvent, ErrorStage, ItemError, Outcome,
    ResultEntry, Transition,
};
pub use correlation::{BatchStarted, CorrelationService, Resolved, SubmissionFailure, Submitter};
pub use error::{CoreError, Result};
pub use persistence::{FilePersistence, RecordStore, RequestIndex, SqlitePersistence};
pub use sweeper::{
    CompletionSink, DeliveryError, DeliveryOutcome, SweepReport, Sweeper, SweeperConfig,
};
