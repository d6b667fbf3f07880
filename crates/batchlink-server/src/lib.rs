// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batchlink server.
//!
//! Thin I/O around [`batchlink_core`]: CSV uploads start batches, each
//! identifier is submitted to the enrichment provider, provider callbacks are
//! correlated back to their batch, and the owner is notified once with the
//! results CSV when the batch completes.
//!
//! ```text
//!   POST /upload ──► upload::parse_identifiers ──► CorrelationService::begin_batch
//!                                                        │  HttpProvider (Submitter)
//!                                                        ▼
//!   POST /callback ─────────────────────────────► CorrelationService::handle_resolution
//!                                                        │  completion
//!                                                        ▼
//!                         Sweeper ──────────────► NotificationDispatcher ──► Notifier
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod notifier;
pub mod provider;
pub mod rows;
pub mod runtime;
pub mod upload;

pub use config::Config;
pub use error::ServerError;
pub use runtime::ServerRuntime;
