//! Process-wide bookkeeping of live replications.
//!
//! The registry is an explicit object owned by the application runtime.
//! Replications register on build and unregister when cancelled, so
//! [`ReplicationRegistry::cancel_all`] can tear everything down
//! deterministically at process shutdown.
//!
//! Entries hold weak references; the registry never keeps a replication
//! alive on its own.

use crate::metrics;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Weak;
use tracing::{debug, info};

/// What the registry needs from a replication.
pub trait RegisteredReplication: Send + Sync {
    /// Replication identifier (shared by replications of the same remote).
    fn identifier(&self) -> &str;

    /// Cancel the replication and wait until it settled.
    fn cancel_boxed(&self) -> BoxFuture<'_, ()>;
}

struct Entry {
    identifier: String,
    replication: Weak<dyn RegisteredReplication>,
}

/// Live replications keyed by instance id.
#[derive(Default)]
pub struct ReplicationRegistry {
    entries: DashMap<u64, Entry>,
}

impl ReplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance_id: u64, identifier: &str, replication: Weak<dyn RegisteredReplication>) {
        self.entries.insert(
            instance_id,
            Entry {
                identifier: identifier.to_string(),
                replication,
            },
        );
        debug!(instance_id, identifier, "Replication registered");
        metrics::set_active_replications(self.entries.len());
    }

    /// Returns whether the instance was registered.
    pub fn unregister(&self, instance_id: u64) -> bool {
        let removed = self.entries.remove(&instance_id).is_some();
        if removed {
            debug!(instance_id, "Replication unregistered");
            metrics::set_active_replications(self.entries.len());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered replications sharing `identifier`.
    pub fn count(&self, identifier: &str) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.identifier == identifier)
            .count()
    }

    /// Cancel every registered replication.
    pub async fn cancel_all(&self) {
        // Collect first: cancelling unregisters, which needs the shard lock.
        let live: Vec<_> = self
            .entries
            .iter()
            .filter_map(|entry| entry.replication.upgrade())
            .collect();

        info!(count = live.len(), "Cancelling all replications");
        for replication in live {
            replication.cancel_boxed().await;
        }
        // Entries whose replication was dropped without cancelling.
        self.entries.retain(|_, entry| entry.replication.strong_count() > 0);
        metrics::set_active_replications(self.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Fake {
        identifier: String,
        cancelled: AtomicBool,
    }

    impl RegisteredReplication for Fake {
        fn identifier(&self) -> &str {
            &self.identifier
        }

        fn cancel_boxed(&self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.cancelled.store(true, Ordering::SeqCst);
            })
        }
    }

    fn fake(identifier: &str) -> Arc<Fake> {
        Arc::new(Fake {
            identifier: identifier.to_string(),
            cancelled: AtomicBool::new(false),
        })
    }

    #[test]
    fn test_register_and_count() {
        let registry = ReplicationRegistry::new();
        let a = fake("remote");
        let b = fake("remote");
        let c = fake("other");
        for (id, r) in [(1, &a), (2, &b), (3, &c)] {
            let weak: Weak<dyn RegisteredReplication> = Arc::downgrade(r) as Weak<dyn RegisteredReplication>;
            registry.register(id, r.identifier(), weak);
        }

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.count("remote"), 2);
        assert_eq!(registry.count("other"), 1);
        assert_eq!(registry.count("missing"), 0);

        assert!(registry.unregister(2));
        assert!(!registry.unregister(2));
        assert_eq!(registry.count("remote"), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_reaches_live_entries() {
        let registry = ReplicationRegistry::new();
        let live = fake("remote");
        let weak: Weak<dyn RegisteredReplication> = Arc::downgrade(&live) as Weak<dyn RegisteredReplication>;
        registry.register(1, "remote", weak);

        let dropped = fake("remote");
        let weak: Weak<dyn RegisteredReplication> = Arc::downgrade(&dropped) as Weak<dyn RegisteredReplication>;
        registry.register(2, "remote", weak);
        drop(dropped);

        registry.cancel_all().await;

        assert!(live.cancelled.load(Ordering::SeqCst));
        // The fake does not unregister itself; only the dead entry is pruned.
        assert_eq!(registry.len(), 1);
    }
}
