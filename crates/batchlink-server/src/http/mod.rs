// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP transport.
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/` | GET | Upload form |
//! | `/health` | GET | Liveness |
//! | `/credits` | GET | Provider credits |
//! | `/upload` | POST | Start a batch from a CSV (`csv_file`, `user_email`) |
//! | `/callback` | POST | Provider resolution report (`Request-Id` header) |
//! | `/status/{batch_id}` | GET | Batch summary |
//! | `/download/{batch_id}` | GET | Results as CSV |

pub mod routes;
pub mod state;

pub use routes::{
    DEFAULT_BODY_LIMIT, REQUEST_ID_HEADER, UploadResponse, create_router,
    create_router_with_body_limit,
};
pub use state::AppState;
