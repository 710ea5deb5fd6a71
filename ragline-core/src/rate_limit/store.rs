//! Concurrent registry of token buckets with idle eviction.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::bucket::TokenBucket;
use super::limiter::Limits;
use crate::command::CommandKind;

/// Rate-limit key: a session, optionally narrowed to one command kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub session_id: String,
    pub kind: Option<CommandKind>,
}

impl BucketKey {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind: None,
        }
    }

    pub fn scoped(session_id: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            session_id: session_id.into(),
            kind: Some(kind),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "session:{}:{}", self.session_id, kind),
            None => write!(f, "session:{}", self.session_id),
        }
    }
}

/// Shared map from [`BucketKey`] to bucket.
///
/// The store lock is held only for lookup, insertion and sweeping; consumption
/// happens under each bucket's own lock after the store lock is released.
#[derive(Debug, Default)]
pub struct BucketStore {
    buckets: Mutex<HashMap<BucketKey, Arc<TokenBucket>>>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the bucket for `key`, creating a full one with `limits` if absent.
    pub fn get_or_create(&self, key: &BucketKey, limits: Limits, now: Instant) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }
        debug!(key = %key, capacity = limits.capacity, refill_rate = limits.refill_rate, "Creating rate limit bucket");
        let bucket = Arc::new(TokenBucket::new(limits.capacity, limits.refill_rate, now));
        buckets.insert(key.clone(), Arc::clone(&bucket));
        bucket
    }

    pub fn get(&self, key: &BucketKey) -> Option<Arc<TokenBucket>> {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Drop every bucket belonging to `session_id`. Returns how many were removed.
    pub fn remove_session(&self, session_id: &str) -> usize {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|key, _| key.session_id != session_id);
        before - buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove buckets idle for longer than `idle_ttl`.
    ///
    /// A bucket still referenced outside the store (a check in flight) is kept
    /// regardless of age. Returns the number of buckets removed.
    pub fn sweep(&self, now: Instant, idle_ttl: Duration) -> usize {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let idle = now.saturating_duration_since(bucket.last_accessed());
            idle <= idle_ttl || Arc::strong_count(bucket) > 1
        });
        before - buckets.len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` on a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, idle_ttl: Duration) -> SweeperHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let store = Arc::clone(self);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep(Instant::now(), idle_ttl);
                        if removed > 0 {
                            debug!(removed, remaining = store.len(), "Swept idle rate limit buckets");
                        }
                    }
                }
            }
        });
        info!(
            interval_secs = interval.as_secs(),
            idle_ttl_secs = idle_ttl.as_secs(),
            "Rate limit sweeper started"
        );
        SweeperHandle {
            cancel,
            join: Some(join),
        }
    }
}

/// Handle to a running sweeper. Dropping it cancels the task.
#[derive(Debug)]
pub struct SweeperHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Cancel the sweeper and wait for it to stop.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
