//! # Replication Handler
//!
//! Purpose: Apply inbound `data-mutation` events to the local store set
//! without re-publishing them or routing them through MOVED, so a cluster
//! converges instead of looping mutations back and forth.
//!
//! ## Design Principles
//! 1. **Single Consumer Thread**: one channel, one dedicated thread, so
//!    events from the same origin are applied in the order they were
//!    received (spec's "single-threaded per node to preserve causal order").
//! 2. **Echo-Drop at the Source**: the subscription closure itself discards
//!    events whose origin is this node, before they ever reach the channel.
//! 3. **Idempotent Application**: `Store::apply_remote_*` already tolerates
//!    replays of the same mutation, so at-least-once delivery is safe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use hkv_common::Value;
use hkv_engine::Store;

use crate::gossip::{DataMutation, GossipEvent, MembershipService, MutationOp};

/// Drains replicated mutation events into the local stores.
pub struct ReplicationHandler {
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationHandler {
    /// Subscribes to `membership`'s event bus and starts the consumer
    /// thread. `stores` is shared with the `Coordinator` so newly
    /// registered stores become replication targets immediately.
    pub fn start(
        local_node_id: String,
        persist_replicated: bool,
        stores: Arc<RwLock<HashMap<String, Arc<Store>>>>,
        membership: &Arc<MembershipService>,
    ) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<DataMutation>();
        let origin_filter = local_node_id.clone();
        membership.on_event(move |event| {
            if let GossipEvent::DataMutation(mutation) = event {
                if mutation.origin_node_id == origin_filter {
                    return;
                }
                let _ = tx.send(mutation);
            }
        });

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let worker = std::thread::Builder::new()
            .name(format!("hkv-replication-{local_node_id}"))
            .spawn(move || {
                while !stop_thread.load(Ordering::Acquire) {
                    match rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(mutation) => apply_mutation(&stores, &mutation, persist_replicated),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn replication handler thread");

        Arc::new(ReplicationHandler {
            stop,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn apply_mutation(
    stores: &RwLock<HashMap<String, Arc<Store>>>,
    mutation: &DataMutation,
    persist_replicated: bool,
) {
    let store = stores.read().get(&mutation.store).cloned();
    let Some(store) = store else {
        warn!(store = %mutation.store, "replicated mutation for unknown store, dropping");
        return;
    };

    let result = match mutation.op {
        MutationOp::Set => match Value::decode(&mutation.value) {
            Ok(value) => {
                let ttl = if mutation.ttl_secs > 0 {
                    Some(Duration::from_secs(mutation.ttl_secs))
                } else {
                    None
                };
                store.apply_remote_set(&mutation.key, value, &mutation.session, ttl, persist_replicated)
            }
            Err(err) => Err(err),
        },
        MutationOp::Del => store.apply_remote_delete(&mutation.key, persist_replicated),
        MutationOp::Clear => store.apply_remote_clear(persist_replicated),
    };

    if let Err(err) = result {
        warn!(
            store = %mutation.store,
            correlation_id = %mutation.correlation_id,
            error = %err,
            "failed to apply replicated mutation"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::InMemoryTransport;
    use crate::member::ClusterMember;
    use crate::ring::HashRing;
    use hkv_engine::{LruPolicy, MemoryPool};

    fn test_store(name: &str) -> Arc<Store> {
        let pool = MemoryPool::new(name, 4096);
        Store::new(name, pool, None, Box::new(LruPolicy::new()), None)
    }

    #[test]
    fn remote_mutation_is_applied_and_echo_is_dropped() {
        let ring = Arc::new(HashRing::new(2));
        let transport = InMemoryTransport::new();
        let local = ClusterMember::new("node-1", "127.0.0.1", 1, 2, 3);
        let membership = MembershipService::new(local, ring, transport);

        let stores = Arc::new(RwLock::new(HashMap::new()));
        stores.write().insert("default".to_string(), test_store("default"));

        let handler = ReplicationHandler::start("node-1".to_string(), false, Arc::clone(&stores), &membership);

        // Echo from self must never reach the store.
        membership.publish(GossipEvent::DataMutation(DataMutation {
            op: MutationOp::Set,
            store: "default".to_string(),
            key: b"echo".to_vec(),
            value: Value::String("x".into()).encode(),
            ttl_secs: 0,
            session: "s1".to_string(),
            origin_node_id: "node-1".to_string(),
            correlation_id: "c1".to_string(),
        }));

        // A mutation from a peer is applied.
        membership.publish(GossipEvent::DataMutation(DataMutation {
            op: MutationOp::Set,
            store: "default".to_string(),
            key: b"remote-key".to_vec(),
            value: Value::String("v".into()).encode(),
            ttl_secs: 0,
            session: "s1".to_string(),
            origin_node_id: "node-2".to_string(),
            correlation_id: "c2".to_string(),
        }));

        let store = stores.read().get("default").cloned().unwrap();
        let mut applied = false;
        for _ in 0..50 {
            if store.get(b"remote-key").is_ok() {
                applied = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(applied);
        assert!(store.get(b"echo").is_err());

        handler.stop();
    }
}
