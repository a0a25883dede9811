//! Optimistic local mutation with rollback.
//!
//! A user action is applied to the cache synchronously, the backend request
//! goes out tagged with a request id, and the transaction is later resolved:
//! `Pending -> Committed` (server value wins over the optimistic guess) or
//! `Pending -> RolledBack` (the pre-mutation snapshot is restored exactly).
//! No other transitions exist.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::EntityCache;
use crate::clock::WallClock;
use crate::error::Transience;
use crate::model::{Entity, RequestId};

#[derive(Debug, Error)]
pub enum MutationError {
    /// A transaction for this key is still pending (or inside the
    /// post-resolution grace window). Rejected, not queued.
    #[error("mutation already in flight for {key}")]
    Busy { key: String },

    /// The backend rejected or failed the request; the cache has already
    /// been restored by the time this is observable.
    #[error("request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("no cached entity with key {key}")]
    UnknownEntity { key: String },
}

impl MutationError {
    pub fn transience(&self) -> Transience {
        match self {
            MutationError::Busy { .. } => Transience::Retryable,
            MutationError::RequestFailed { .. } => Transience::Unknown,
            MutationError::UnknownEntity { .. } => Transience::Permanent,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnStatus {
    Pending,
    Committed,
    RolledBack,
}

/// How a completed or expired transaction resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Committed,
    RolledBack,
    /// Completion for a request this coordinator no longer tracks
    /// (duplicate completion, or one that raced the timeout sweep).
    Unknown,
}

struct Transaction<T: Entity> {
    request_id: RequestId,
    /// None when the optimistic write created the row.
    previous: Option<T>,
    deadline: WallClock,
}

pub struct MutationCoordinator<T: Entity> {
    timeout_ms: u64,
    grace_ms: u64,
    pending: HashMap<T::Id, Transaction<T>>,
    by_request: HashMap<RequestId, T::Id>,
    resolved_at: HashMap<T::Id, WallClock>,
}

impl<T: Entity> MutationCoordinator<T> {
    pub fn new(timeout_ms: u64, grace_ms: u64) -> Self {
        Self {
            timeout_ms,
            grace_ms,
            pending: HashMap::new(),
            by_request: HashMap::new(),
            resolved_at: HashMap::new(),
        }
    }

    /// Whether a new mutation on `key` would be rejected right now.
    pub fn is_busy(&self, key: &T::Id, now: WallClock) -> bool {
        if self.pending.contains_key(key) {
            return true;
        }
        match self.resolved_at.get(key) {
            Some(at) => now.millis_since(*at) < self.grace_ms,
            None => false,
        }
    }

    /// Snapshot, apply the proposed value to the cache synchronously, and
    /// register the pending transaction. The returned request id tags the
    /// outbound backend call.
    pub fn begin_upsert(
        &mut self,
        cache: &mut EntityCache<T>,
        proposed: T,
        now: WallClock,
    ) -> Result<RequestId, MutationError> {
        let key = proposed.id().clone();
        self.check_free(&key, now)?;

        let previous = cache.get(&key).cloned();
        cache.upsert_local(proposed);
        Ok(self.register(key, previous, now))
    }

    /// Optimistically remove the entity; rollback reinstates it.
    pub fn begin_delete(
        &mut self,
        cache: &mut EntityCache<T>,
        key: T::Id,
        now: WallClock,
    ) -> Result<RequestId, MutationError> {
        self.check_free(&key, now)?;
        let previous = cache.get(&key).cloned();
        if previous.is_none() {
            return Err(MutationError::UnknownEntity {
                key: key.to_string(),
            });
        }
        cache.remove_local(&key);
        Ok(self.register(key, previous, now))
    }

    /// Success response. When the backend returned a canonical entity the
    /// cache entry is replaced with it, so server-computed fields win over
    /// the optimistic guess.
    pub fn commit(
        &mut self,
        cache: &mut EntityCache<T>,
        request_id: RequestId,
        server_value: Option<T>,
        now: WallClock,
    ) -> Resolution {
        let Some(txn) = self.take(request_id) else {
            debug!(%request_id, "completion for unknown transaction ignored");
            return Resolution::Unknown;
        };
        if let Some(canonical) = server_value {
            cache.upsert_local(canonical);
        }
        self.resolve(txn, TxnStatus::Committed, now);
        Resolution::Committed
    }

    /// Failure response: restore the snapshot captured before the optimistic
    /// write, all-or-nothing.
    pub fn rollback(
        &mut self,
        cache: &mut EntityCache<T>,
        request_id: RequestId,
        now: WallClock,
    ) -> Resolution {
        let Some(txn) = self.take(request_id) else {
            debug!(%request_id, "rollback for unknown transaction ignored");
            return Resolution::Unknown;
        };
        Self::restore(cache, &txn);
        self.resolve(txn, TxnStatus::RolledBack, now);
        Resolution::RolledBack
    }

    /// Cooperative timeout sweep: transactions past their deadline resolve
    /// to `RolledBack` rather than staying `Pending` indefinitely. Returns
    /// the affected request ids and keys. Also prunes expired grace entries.
    pub fn expire(&mut self, cache: &mut EntityCache<T>, now: WallClock) -> Vec<(RequestId, T::Id)> {
        let expired: Vec<RequestId> = self
            .pending
            .values()
            .filter(|txn| txn.deadline <= now)
            .map(|txn| txn.request_id)
            .collect();

        let mut rolled = Vec::with_capacity(expired.len());
        for request_id in expired {
            if let Some(txn) = self.take(request_id) {
                warn!(%request_id, "mutation timed out, rolling back");
                Self::restore(cache, &txn);
                let key = self.resolve(txn, TxnStatus::RolledBack, now);
                rolled.push((request_id, key));
            }
        }

        let grace_ms = self.grace_ms;
        self.resolved_at
            .retain(|_, at| now.millis_since(*at) < grace_ms);
        rolled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn check_free(&self, key: &T::Id, now: WallClock) -> Result<(), MutationError> {
        if self.is_busy(key, now) {
            return Err(MutationError::Busy {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn register(&mut self, key: T::Id, previous: Option<T>, now: WallClock) -> RequestId {
        let request_id = RequestId::new();
        self.by_request.insert(request_id, key.clone());
        self.pending.insert(
            key,
            Transaction {
                request_id,
                previous,
                deadline: now.saturating_add_ms(self.timeout_ms),
            },
        );
        request_id
    }

    fn take(&mut self, request_id: RequestId) -> Option<TakenTxn<T>> {
        let key = self.by_request.remove(&request_id)?;
        let txn = self.pending.remove(&key)?;
        Some(TakenTxn { key, txn })
    }

    fn resolve(&mut self, taken: TakenTxn<T>, status: TxnStatus, now: WallClock) -> T::Id {
        debug_assert_ne!(status, TxnStatus::Pending);
        self.resolved_at.insert(taken.key.clone(), now);
        taken.key
    }

    fn restore(cache: &mut EntityCache<T>, taken: &TakenTxn<T>) {
        match &taken.txn.previous {
            Some(previous) => cache.upsert_local(previous.clone()),
            None => cache.remove_local(&taken.key),
        }
    }
}

struct TakenTxn<T: Entity> {
    key: T::Id,
    txn: Transaction<T>,
}
