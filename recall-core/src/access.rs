//! Background access tracking.
//!
//! Every Get and Search hit bumps `access_count`, stamps `accessed_at` and
//! resets `decay_weight` to 1.0. That write happens off the request path:
//! reads push a message into a bounded queue and a single worker task applies
//! them in order. A full queue drops the update with a warning rather than
//! slowing the read down. Failures are logged, never returned.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::call::CallContext;
use crate::model::MemoryKind;
use crate::store::Store;
use crate::types::Timestamp;

enum AccessMsg {
    Touch {
        kind: MemoryKind,
        ids: Vec<String>,
        at: Timestamp,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    applied: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of tracker activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessStats {
    /// Batches accepted into the queue.
    pub queued: u64,
    /// Rows the store reported as updated.
    pub applied: u64,
    /// Batches dropped because the queue was full or closed.
    pub dropped: u64,
    /// Batches the store rejected.
    pub failed: u64,
}

/// Handle to the access-tracking worker. Cheap to clone.
#[derive(Clone)]
pub struct AccessTracker {
    tx: mpsc::Sender<AccessMsg>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for AccessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTracker")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl AccessTracker {
    /// Start the worker on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn spawn(store: Arc<dyn Store>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AccessMsg>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker_counters = Arc::clone(&counters);

        tokio::spawn(async move {
            let ctx = CallContext::background();
            while let Some(msg) = rx.recv().await {
                match msg {
                    AccessMsg::Touch { kind, ids, at } => {
                        match store.record_access(&ctx, kind, &ids, at).await {
                            Ok(n) => {
                                worker_counters
                                    .applied
                                    .fetch_add(n as u64, Ordering::Relaxed);
                                debug!(kind = %kind, requested = ids.len(), updated = n, "access recorded");
                            }
                            Err(e) => {
                                worker_counters.failed.fetch_add(1, Ordering::Relaxed);
                                warn!(kind = %kind, error = %e, "access tracking failed");
                            }
                        }
                    }
                    AccessMsg::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!("access tracker stopped");
        });

        Self { tx, counters }
    }

    /// Queue an access update. Never blocks and never fails the caller.
    pub fn record(&self, kind: MemoryKind, ids: Vec<String>, at: Timestamp) {
        if ids.is_empty() {
            return;
        }
        let count = ids.len();
        match self.tx.try_send(AccessMsg::Touch { kind, ids, at }) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = %kind, ids = count, "access queue full, update dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = %kind, ids = count, "access tracker stopped, update dropped");
            }
        }
    }

    /// Wait until every update queued before this call has been applied.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(AccessMsg::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> AccessStats {
        AccessStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            applied: self.counters.applied.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityDraft, Record};
    use crate::store::SqliteStore;
    use crate::types::{Embedding, now};

    async fn store_with(ids: &[&str]) -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
        for id in ids {
            let e = EntityDraft::new(*id, "concept", "content").into_entity(
                (*id).to_string(),
                Embedding(vec![1.0, 0.0]),
                now(),
            );
            store
                .upsert(&CallContext::background(), Record::Entity(e))
                .await
                .expect("upsert");
        }
        store
    }

    #[tokio::test]
    async fn flush_waits_for_pending_updates() {
        let store = store_with(&["a", "b"]).await;
        let tracker = AccessTracker::spawn(store.clone(), 16);
        tracker.record(MemoryKind::Entity, vec!["a".into(), "b".into()], now());
        tracker.record(MemoryKind::Entity, vec!["a".into()], now());
        tracker.flush().await;

        let got = store
            .get(&CallContext::background(), MemoryKind::Entity, &["a".to_string()])
            .await
            .expect("get");
        let Record::Entity(a) = &got[0] else {
            panic!("wrong kind");
        };
        assert_eq!(a.access_count, 2);
        assert_eq!(tracker.stats().applied, 3);
    }

    #[tokio::test]
    async fn missing_ids_are_harmless() {
        let store = store_with(&[]).await;
        let tracker = AccessTracker::spawn(store, 4);
        tracker.record(MemoryKind::Episode, vec!["ghost".into()], now());
        tracker.flush().await;
        let stats = tracker.stats();
        assert_eq!(stats.applied, 0);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn empty_batches_are_not_queued() {
        let store = store_with(&[]).await;
        let tracker = AccessTracker::spawn(store, 4);
        tracker.record(MemoryKind::Entity, Vec::new(), now());
        assert_eq!(tracker.stats().queued, 0);
    }
}
