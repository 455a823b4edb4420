//! Mercury watch: the event-source boundary feeding the cache.
//!
//! Watchers observe the control plane (CR watch streams) and the
//! messaging agents, translate what they see into `CacheEvent`s, and an
//! apply loop drains a per-UID coalescing queue into the cache. Ordering
//! per UID is causal: the queue keeps FIFO order across distinct UIDs and
//! collapses bursts for the same UID to the latest state.

#![forbid(unsafe_code)]

pub mod agent;
pub mod kube;

use std::collections::VecDeque;
use std::sync::Arc;

use mercury_cache::ObjectCache;
use mercury_core::{Object, Uid};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum CacheEvent {
    Applied(Object),
    Deleted(Uid),
}

impl CacheEvent {
    pub fn uid(&self) -> &str {
        match self {
            CacheEvent::Applied(o) => o.uid(),
            CacheEvent::Deleted(uid) => uid,
        }
    }
}

/// Coalescing queue keyed by UID with FIFO order and fixed capacity.
/// A burst of events for one object collapses to the latest; overflow
/// drops the oldest queued UID and counts the drop.
pub struct EventQueue {
    map: FxHashMap<Uid, CacheEvent>,
    order: VecDeque<Uid>,
    cap: usize,
    dropped: u64,
}

impl EventQueue {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap, dropped: 0 }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn push(&mut self, ev: CacheEvent) {
        let uid = ev.uid().to_string();
        if !self.map.contains_key(&uid) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                    metrics::counter!("watch_events_dropped_total", 1u64);
                }
            }
            self.order.push_back(uid.clone());
        }
        self.map.insert(uid, ev);
    }

    /// Drain all currently coalesced events in arrival order.
    pub fn drain_ready(&mut self) -> Vec<CacheEvent> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(uid) = self.order.pop_front() {
            if let Some(ev) = self.map.remove(&uid) {
                out.push(ev);
            }
        }
        out
    }
}

/// Apply one drained batch to the cache under a single writer pass.
/// Applied events upsert so watch restarts (relists) are idempotent.
pub fn apply_batch(cache: &ObjectCache, batch: Vec<CacheEvent>) -> usize {
    let mut applied = 0usize;
    let mut deletes: Vec<Uid> = Vec::new();
    let mut upserts: Vec<Object> = Vec::new();
    for ev in batch {
        match ev {
            CacheEvent::Applied(o) => upserts.push(o),
            CacheEvent::Deleted(uid) => deletes.push(uid),
        }
    }
    if !upserts.is_empty() {
        let out = cache.upsert(upserts);
        applied += out.accepted;
        for e in &out.rejected {
            warn!(error = %e, "watch event rejected by cache");
        }
    }
    applied += cache.delete(deletes.iter());
    metrics::counter!("watch_events_applied_total", applied as u64);
    applied
}

/// Handle readers use to wait for the apply loop to make progress.
pub struct ApplyHandle {
    epoch_rx: watch::Receiver<u64>,
}

impl ApplyHandle {
    pub fn epoch(&self) -> u64 {
        *self.epoch_rx.borrow()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }
}

/// Spawn the apply loop: consume events, coalesce per UID, and flush
/// batches into the cache on a short ticker. Returns the event sender and
/// a handle for readers to observe apply epochs.
pub fn spawn_apply(cache: Arc<ObjectCache>, cap: usize) -> (mpsc::Sender<CacheEvent>, ApplyHandle) {
    let (tx, mut rx) = mpsc::channel::<CacheEvent>(cap);
    let (epoch_tx, epoch_rx) = watch::channel(0u64);

    tokio::spawn(async move {
        let mut queue = EventQueue::with_capacity(cap);
        let mut epoch = 0u64;
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(ev) => queue.push(ev),
                        None => {
                            debug!("event channel closed; draining and exiting apply loop");
                            let batch = queue.drain_ready();
                            if !batch.is_empty() {
                                apply_batch(&cache, batch);
                                epoch += 1;
                                let _ = epoch_tx.send(epoch);
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let batch = queue.drain_ready();
                    if !batch.is_empty() {
                        apply_batch(&cache, batch);
                        epoch += 1;
                        let _ = epoch_tx.send(epoch);
                    }
                }
            }
        }
        info!("apply loop stopped");
    });

    (tx, ApplyHandle { epoch_rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercury_cache::hierarchy::standard_object_cache;
    use mercury_core::{ConnectionSpec, Kind, ObjectMeta, Spec};

    fn connection(host: &str, uid: &str) -> Object {
        let mut metadata = ObjectMeta::named(host, "ns");
        metadata.uid = uid.to_string();
        Object {
            kind: Kind::Connection,
            metadata,
            spec: Spec::Connection(ConnectionSpec {
                address_space: "space".into(),
                hostname: host.into(),
                container_id: "c".into(),
                protocol: "amqp".into(),
                encrypted: false,
            }),
        }
    }

    #[test]
    fn queue_coalesces_per_uid_and_keeps_fifo() {
        let mut q = EventQueue::with_capacity(16);
        q.push(CacheEvent::Applied(connection("host:1", "u1")));
        q.push(CacheEvent::Applied(connection("host:2", "u2")));
        q.push(CacheEvent::Deleted("u1".into()));
        assert_eq!(q.len(), 2);
        let batch = q.drain_ready();
        // u1 collapsed to its final state, arrival order preserved.
        assert!(matches!(&batch[0], CacheEvent::Deleted(uid) if uid == "u1"));
        assert!(matches!(&batch[1], CacheEvent::Applied(o) if o.uid() == "u2"));
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let mut q = EventQueue::with_capacity(2);
        q.push(CacheEvent::Applied(connection("host:1", "u1")));
        q.push(CacheEvent::Applied(connection("host:2", "u2")));
        q.push(CacheEvent::Applied(connection("host:3", "u3")));
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped(), 1);
        let uids: Vec<String> = q.drain_ready().iter().map(|e| e.uid().to_string()).collect();
        assert_eq!(uids, vec!["u2", "u3"]);
    }

    #[test]
    fn apply_batch_upserts_and_deletes() {
        let cache = Arc::new(standard_object_cache().unwrap());
        apply_batch(
            &cache,
            vec![
                CacheEvent::Applied(connection("host:1", "u1")),
                CacheEvent::Applied(connection("host:2", "u2")),
            ],
        );
        assert_eq!(cache.len(), 2);
        // Re-applied object replaces, deletes are idempotent.
        apply_batch(
            &cache,
            vec![
                CacheEvent::Applied(connection("host:1b", "u1")),
                CacheEvent::Deleted("u2".into()),
                CacheEvent::Deleted("missing".into()),
            ],
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("u1").unwrap().metadata.name, "host:1b");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_loop_flushes_batches() {
        let cache = Arc::new(standard_object_cache().unwrap());
        let (tx, handle) = spawn_apply(Arc::clone(&cache), 64);
        tx.send(CacheEvent::Applied(connection("host:1", "u1"))).await.unwrap();
        tx.send(CacheEvent::Applied(connection("host:2", "u2"))).await.unwrap();
        drop(tx);
        let mut rx = handle.subscribe_epoch();
        while *rx.borrow() == 0 {
            if rx.changed().await.is_err() {
                break;
            }
        }
        assert_eq!(cache.len(), 2);
    }
}
