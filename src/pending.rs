//! Pending subscribe/unsubscribe requests with expiry.
//!
//! Every request lives in a bucket keyed by `(symbol, direction)` until it is
//! acknowledged, cancelled or its deadline fires. Removal from the bucket
//! happens under one lock, and whoever removes the entry is the only party
//! allowed to signal its completion channel, so a request is completed
//! exactly once even when an ack and the deadline race.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::oneshot, task::AbortHandle};

use crate::{
    errors::{SyncError, SyncResult},
    types::{Direction, EventKind, Nonce, Symbol},
};

/// How a pending request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    Rejected,
    TimedOut,
    Cancelled,
}

impl AckOutcome {
    fn from_success(success: bool) -> Self {
        if success {
            AckOutcome::Acknowledged
        } else {
            AckOutcome::Rejected
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub symbol: Symbol,
    pub direction: Direction,
}

impl PendingKey {
    pub fn new(symbol: Symbol, direction: Direction) -> Self {
        Self { symbol, direction }
    }
}

/// A request that has left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequest {
    pub nonce: Nonce,
    pub symbol: Symbol,
    pub kind: EventKind,
    pub direction: Direction,
    pub outcome: AckOutcome,
}

#[derive(Debug)]
struct PendingRequest {
    nonce: Nonce,
    kind: EventKind,
    deadline: AbortHandle,
    completion: oneshot::Sender<AckOutcome>,
}

impl PendingRequest {
    fn complete(self, key: &PendingKey, outcome: AckOutcome) -> ResolvedRequest {
        // the waiting side may have dropped its receiver already
        let _ = self.completion.send(outcome);
        ResolvedRequest {
            nonce: self.nonce,
            symbol: key.symbol.clone(),
            kind: self.kind,
            direction: key.direction,
            outcome,
        }
    }
}

type Buckets = HashMap<PendingKey, HashMap<Nonce, PendingRequest>>;

#[derive(Debug, Clone, Default)]
pub struct NonceTimeoutRegistry {
    buckets: Arc<Mutex<Buckets>>,
}

impl NonceTimeoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a pending request and arms its deadline.
    ///
    /// When `ttl` elapses before the request is resolved, the entry is removed,
    /// its receiver gets [`AckOutcome::TimedOut`] and `on_expire` runs once.
    /// Must be called from inside a Tokio runtime.
    pub fn register<F>(
        &self,
        symbol: Symbol,
        kind: EventKind,
        direction: Direction,
        nonce: Nonce,
        ttl: Duration,
        on_expire: F,
    ) -> SyncResult<oneshot::Receiver<AckOutcome>>
    where
        F: FnOnce(ResolvedRequest) + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let key = PendingKey::new(symbol, direction);

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.clone()).or_default();
        if bucket.contains_key(&nonce) {
            return Err(SyncError::DuplicateNonce {
                symbol: key.symbol,
                nonce,
            });
        }

        let (completion, receiver) = oneshot::channel();
        let shared = Arc::clone(&self.buckets);
        let timer_key = key.clone();
        // The lock is held until the entry is inserted, so a zero ttl still
        // finds the request when the timer task wakes.
        let task = runtime.spawn(async move {
            tokio::time::sleep(ttl).await;
            let expired = take(&mut shared.lock(), &timer_key, nonce);
            if let Some(request) = expired {
                let resolved = request.complete(&timer_key, AckOutcome::TimedOut);
                tracing::warn!(
                    symbol = %resolved.symbol,
                    nonce = %resolved.nonce,
                    direction = %resolved.direction,
                    "pending request expired"
                );
                on_expire(resolved);
            }
        });

        bucket.insert(
            nonce,
            PendingRequest {
                nonce,
                kind,
                deadline: task.abort_handle(),
                completion,
            },
        );
        Ok(receiver)
    }

    /// Resolves one request; returns whether it was pending.
    pub fn resolve(
        &self,
        symbol: &Symbol,
        direction: Direction,
        nonce: Nonce,
        success: bool,
    ) -> bool {
        let key = PendingKey::new(symbol.clone(), direction);
        let removed = take(&mut self.buckets.lock(), &key, nonce);
        match removed {
            Some(request) => {
                request.deadline.abort();
                request.complete(&key, AckOutcome::from_success(success));
                true
            }
            None => false,
        }
    }

    /// Resolves every request pending for `(symbol, direction)`, oldest nonce first.
    pub fn resolve_all(
        &self,
        symbol: &Symbol,
        direction: Direction,
        success: bool,
    ) -> Vec<ResolvedRequest> {
        let key = PendingKey::new(symbol.clone(), direction);
        let bucket = self.buckets.lock().remove(&key).unwrap_or_default();
        finish_all(&key, bucket, AckOutcome::from_success(success))
    }

    /// Cancels every pending request and its deadline.
    pub fn cancel_all(&self) -> Vec<ResolvedRequest> {
        let drained: Vec<_> = self.buckets.lock().drain().collect();
        drained
            .into_iter()
            .flat_map(|(key, bucket)| finish_all(&key, bucket, AckOutcome::Cancelled))
            .collect()
    }

    pub fn pending(&self, symbol: &Symbol, direction: Direction) -> Vec<Nonce> {
        let key = PendingKey::new(symbol.clone(), direction);
        let mut nonces: Vec<Nonce> = self
            .buckets
            .lock()
            .get(&key)
            .map(|bucket| bucket.keys().copied().collect())
            .unwrap_or_default();
        nonces.sort_unstable();
        nonces
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn take(buckets: &mut Buckets, key: &PendingKey, nonce: Nonce) -> Option<PendingRequest> {
    let bucket = buckets.get_mut(key)?;
    let request = bucket.remove(&nonce);
    if bucket.is_empty() {
        buckets.remove(key);
    }
    request
}

fn finish_all(
    key: &PendingKey,
    bucket: HashMap<Nonce, PendingRequest>,
    outcome: AckOutcome,
) -> Vec<ResolvedRequest> {
    let mut requests: Vec<PendingRequest> = bucket.into_values().collect();
    requests.sort_unstable_by_key(|request| request.nonce);
    requests
        .into_iter()
        .map(|request| {
            request.deadline.abort();
            request.complete(key, outcome)
        })
        .collect()
}
