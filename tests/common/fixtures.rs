//! Document builders, configs and polling helpers.

use super::FlakyMaster;
use replication_protocol::{
    ConflictHandler, Document, MemoryForkStore, MemoryMetaStore, MetaStore, ReplicationConfig, ReplicationState,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn doc(id: &str, name: &str) -> Document {
    Document::new(id, json!({ "name": name }))
}

/// Live config with fast retries and an in-memory meta store.
pub fn live_config(identifier: &str) -> ReplicationConfig {
    ReplicationConfig {
        live: true,
        ..ReplicationConfig::for_testing(identifier)
    }
}

/// Poll `check` every 10ms until it holds or [`WAIT`] elapses.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Options for [`replicate`].
pub struct Setup {
    pub config: ReplicationConfig,
    pub meta: Arc<dyn MetaStore>,
    pub conflict: Option<Arc<dyn ConflictHandler>>,
}

impl Setup {
    pub fn live(identifier: &str) -> Self {
        Self {
            config: live_config(identifier),
            meta: Arc::new(MemoryMetaStore::new()),
            conflict: None,
        }
    }

    pub fn meta(mut self, meta: Arc<dyn MetaStore>) -> Self {
        self.meta = meta;
        self
    }

    pub fn conflict(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.conflict = Some(handler);
        self
    }
}

/// Build a replication of `fork` against `master` without starting it.
pub async fn build(
    fork: &Arc<MemoryForkStore>,
    master: &Arc<FlakyMaster>,
    setup: Setup,
) -> Arc<ReplicationState<MemoryForkStore>> {
    let mut builder = ReplicationState::builder(fork.clone())
        .config(setup.config)
        .meta_store(setup.meta)
        .pull(master.clone())
        .push(master.clone());
    if let Some(conflict) = setup.conflict {
        builder = builder.conflict_handler(conflict);
    }
    builder.build().await.expect("build replication")
}

/// Build and start a replication of `fork` against `master`.
pub async fn replicate(
    fork: &Arc<MemoryForkStore>,
    master: &Arc<FlakyMaster>,
    setup: Setup,
) -> Arc<ReplicationState<MemoryForkStore>> {
    let state = build(fork, master, setup).await;
    state.start().await;
    state
}

/// Wait until the replication reports in sync.
pub async fn in_sync(state: &ReplicationState<MemoryForkStore>) {
    tokio::time::timeout(WAIT, state.await_in_sync())
        .await
        .expect("in sync within timeout")
        .expect("replication not cancelled");
}

/// Fork and master hold the same documents.
pub async fn assert_equal_state(fork: &MemoryForkStore, master: &FlakyMaster) {
    assert_eq!(fork.documents().await, master.store().documents().await);
}
