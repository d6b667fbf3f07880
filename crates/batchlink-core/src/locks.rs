// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-batch mutual exclusion.
//!
//! Read-modify-write of a batch record is a critical section scoped to that
//! batch ID. Different batches never contend with each other.
//!
//! [`DeliveryClaims`] marks batches whose completion notice is being sent,
//! which can take far longer than any record update and so is not done under
//! the batch lock.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-batch async mutexes.
///
/// Entries are dropped again once nobody holds or waits on them.
#[derive(Debug, Default)]
pub struct BatchLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl BatchLocks {
    /// Create an empty lock registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `batch_id`, waiting for any current holder.
    pub async fn lock(&self, batch_id: &str) -> BatchGuard {
        // The map shard lock must be released before awaiting the mutex.
        let mutex = self
            .locks
            .entry(batch_id.to_string())
            .or_default()
            .value()
            .clone();

        let guard = mutex.lock_owned().await;
        BatchGuard {
            batch_id: batch_id.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Number of batches with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no batch currently has a lock entry.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held lock on one batch. Released on drop.
pub struct BatchGuard {
    batch_id: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or waits on it.
        // Waiters clone the Arc under the shard lock, so this check is race-free.
        self.locks
            .remove_if(&self.batch_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Batches with a completion delivery in flight, in this process.
#[derive(Debug, Default)]
pub struct DeliveryClaims {
    claimed: Arc<DashSet<String>>,
}

impl DeliveryClaims {
    /// Create an empty claim set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim delivery for `batch_id`. `None` while another claim is live.
    pub fn claim(&self, batch_id: &str) -> Option<DeliveryClaim> {
        self.claimed
            .insert(batch_id.to_string())
            .then(|| DeliveryClaim {
                batch_id: batch_id.to_string(),
                claimed: self.claimed.clone(),
            })
    }

    /// Whether a delivery for `batch_id` is in flight.
    pub fn is_claimed(&self, batch_id: &str) -> bool {
        self.claimed.contains(batch_id)
    }
}

/// Live delivery claim. Released on drop.
#[derive(Debug)]
pub struct DeliveryClaim {
    batch_id: String,
    claimed: Arc<DashSet<String>>,
}

impl Drop for DeliveryClaim {
    fn drop(&mut self) {
        self.claimed.remove(&self.batch_id);
    }
}
