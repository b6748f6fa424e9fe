//! Durable arm persistence
//!
//! The store seam is a narrow async contract: bulk load at startup, batched
//! state upserts, arm inserts and best-effort deletes. No transaction
//! semantics are assumed beyond per-call atomicity of a batch.
//!
//! Learned state reaches the store through dirty tracking: the selector
//! marks an arm after each update, and the flusher periodically drains a
//! bounded batch, snapshots those heads and writes them in one call. Ids
//! that fail to flush stay marked for the next cycle (at-least-once, not
//! exactly-once). Draining snapshots-and-clears under the lock and flushes
//! outside it, so slow storage never blocks request-path writers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tactica_common::StoreError;

use crate::bandit::BanditHeadState;
use crate::registry::ArmRegistry;

/// Full arm row as stored durably
#[derive(Debug, Clone)]
pub struct ArmRecord {
    pub id: String,
    pub graph_json: String,
    pub mode: String,
    /// Absent for arms inserted before their first learned update
    pub head: Option<BanditHeadState>,
}

/// Learned-state-only row for batched upserts
#[derive(Debug, Clone)]
pub struct ArmStateRecord {
    pub id: String,
    pub head: BanditHeadState,
}

/// Narrow contract with the durable store
#[async_trait]
pub trait ArmStore: Send + Sync {
    /// Bulk-load every stored arm
    async fn load_all_arms(&self) -> Result<Vec<ArmRecord>, StoreError>;

    /// Write a batch of learned states; the batch succeeds or fails as one
    async fn upsert_arm_states(&self, batch: Vec<ArmStateRecord>) -> Result<(), StoreError>;

    /// Insert newly minted arms
    async fn insert_arms(&self, batch: Vec<ArmRecord>) -> Result<(), StoreError>;

    /// Delete pruned arms (best-effort)
    async fn delete_arms(&self, ids: Vec<String>) -> Result<(), StoreError>;
}

/// In-memory store double.
///
/// Backs tests and local runs; `set_failing` injects flush failures so
/// at-least-once retry behavior can be exercised.
#[derive(Default)]
pub struct InMemoryArmStore {
    rows: DashMap<String, ArmRecord>,
    failing: AtomicBool,
}

impl InMemoryArmStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent write calls fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<ArmRecord> {
        self.rows.get(id).map(|r| r.clone())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ArmStore for InMemoryArmStore {
    async fn load_all_arms(&self) -> Result<Vec<ArmRecord>, StoreError> {
        self.check_available()?;
        Ok(self.rows.iter().map(|r| r.clone()).collect())
    }

    async fn upsert_arm_states(&self, batch: Vec<ArmStateRecord>) -> Result<(), StoreError> {
        self.check_available()?;
        for record in batch {
            if let Some(mut row) = self.rows.get_mut(&record.id) {
                row.head = Some(record.head);
            } else {
                // state for an arm the store has never seen: keep it, the
                // insert may arrive out of order
                self.rows.insert(
                    record.id.clone(),
                    ArmRecord {
                        id: record.id,
                        graph_json: String::new(),
                        mode: String::new(),
                        head: Some(record.head),
                    },
                );
            }
        }
        Ok(())
    }

    async fn insert_arms(&self, batch: Vec<ArmRecord>) -> Result<(), StoreError> {
        self.check_available()?;
        for record in batch {
            self.rows.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn delete_arms(&self, ids: Vec<String>) -> Result<(), StoreError> {
        self.check_available()?;
        for id in ids {
            self.rows.remove(&id);
        }
        Ok(())
    }
}

/// Dirty-tracking snapshot flusher
pub struct PersistenceFlusher {
    dirty: Mutex<HashSet<String>>,
    registry: Arc<ArmRegistry>,
    store: Arc<dyn ArmStore>,
    batch_size: usize,
    shutdown_retries: usize,
}

impl PersistenceFlusher {
    pub fn new(
        registry: Arc<ArmRegistry>,
        store: Arc<dyn ArmStore>,
        batch_size: usize,
        shutdown_retries: usize,
    ) -> Self {
        Self {
            dirty: Mutex::new(HashSet::new()),
            registry,
            store,
            batch_size: batch_size.max(1),
            shutdown_retries,
        }
    }

    /// Mark an arm's learned state as needing persistence
    pub fn mark_dirty(&self, arm_id: impl Into<String>) {
        self.dirty.lock().insert(arm_id.into());
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Drain one bounded batch and write it; returns the number of arms
    /// flushed. Failed ids are re-marked for the next cycle.
    pub async fn flush_once(&self) -> usize {
        let batch_ids: Vec<String> = {
            let mut dirty = self.dirty.lock();
            let ids: Vec<String> = dirty.iter().take(self.batch_size).cloned().collect();
            for id in &ids {
                dirty.remove(id);
            }
            ids
        };
        if batch_ids.is_empty() {
            return 0;
        }

        // snapshot heads outside the dirty lock; arms pruned since their
        // mark simply drop out of the batch
        let mut batch = Vec::with_capacity(batch_ids.len());
        let mut snapshot_ids = Vec::with_capacity(batch_ids.len());
        for id in batch_ids {
            if let Some(arm) = self.registry.get_arm(&id) {
                batch.push(ArmStateRecord {
                    id: id.clone(),
                    head: arm.head_state(),
                });
                snapshot_ids.push(id);
            }
        }
        if batch.is_empty() {
            return 0;
        }

        let count = batch.len();
        match self.store.upsert_arm_states(batch).await {
            Ok(()) => {
                debug!(flushed = count, "arm state batch persisted");
                count
            }
            Err(e) => {
                warn!(error = %e, retained = count, "flush failed; arms stay dirty");
                let mut dirty = self.dirty.lock();
                for id in snapshot_ids {
                    dirty.insert(id);
                }
                0
            }
        }
    }

    /// Flush until the dirty set is empty or the retry budget is spent.
    ///
    /// Called on shutdown so no learned state is silently lost.
    pub async fn drain(&self) {
        let mut failures = 0usize;
        while self.dirty_count() > 0 {
            if self.flush_once().await == 0 {
                failures += 1;
                if failures > self.shutdown_retries {
                    warn!(
                        remaining = self.dirty_count(),
                        "giving up shutdown drain; state remains dirty"
                    );
                    return;
                }
            }
        }
    }

    /// Periodic flush loop with cooperative cancellation.
    ///
    /// On shutdown, performs one final synchronous drain before returning.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.drain().await;
                        info!("persistence flusher stopped");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::SafetyGate;
    use crate::registry::ArmOrigin;
    use tactica_common::PolicyGraph;

    fn setup() -> (Arc<ArmRegistry>, Arc<InMemoryArmStore>, PersistenceFlusher) {
        let registry = Arc::new(ArmRegistry::new(Arc::new(SafetyGate::default()), 4, 1.0));
        let store = Arc::new(InMemoryArmStore::new());
        let flusher = PersistenceFlusher::new(registry.clone(), store.clone(), 8, 2);
        (registry, store, flusher)
    }

    #[tokio::test]
    async fn test_flush_writes_marked_arms_only() {
        let (registry, store, flusher) = setup();
        registry.add_arm("a1", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);
        registry.add_arm("a2", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);

        flusher.mark_dirty("a1");
        let flushed = flusher.flush_once().await;

        assert_eq!(flushed, 1);
        assert_eq!(flusher.dirty_count(), 0);
        assert!(store.get("a1").is_some());
        assert!(store.get("a2").is_none());
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_arms_dirty() {
        let (registry, store, flusher) = setup();
        registry.add_arm("a1", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);

        flusher.mark_dirty("a1");
        store.set_failing(true);
        assert_eq!(flusher.flush_once().await, 0);
        assert_eq!(flusher.dirty_count(), 1);

        // next cycle succeeds
        store.set_failing(false);
        assert_eq!(flusher.flush_once().await, 1);
        assert_eq!(flusher.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_mark_for_pruned_arm_is_dropped() {
        let (registry, _store, flusher) = setup();
        registry.add_arm("gone", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);
        flusher.mark_dirty("gone");
        registry.remove_arms(&["gone".to_string()]);

        assert_eq!(flusher.flush_once().await, 0);
        assert_eq!(flusher.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_respects_retry_budget() {
        let (registry, store, flusher) = setup();
        registry.add_arm("a1", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);
        flusher.mark_dirty("a1");
        store.set_failing(true);

        flusher.drain().await;
        // budget exhausted, arm still dirty rather than lost
        assert_eq!(flusher.dirty_count(), 1);
    }

    #[tokio::test]
    async fn test_drain_empties_dirty_set() {
        let (registry, store, flusher) = setup();
        for i in 0..20 {
            let id = format!("a{i}");
            registry.add_arm(id.clone(), PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);
            flusher.mark_dirty(id);
        }

        flusher.drain().await;
        assert_eq!(flusher.dirty_count(), 0);
        assert_eq!(store.len(), 20);
    }
}
