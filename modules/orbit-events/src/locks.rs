//! Per-entity mutual exclusion for transactions.
//!
//! Each entity id maps to its own async mutex. A transaction takes every
//! lock it needs up front, in sorted id order, so two transactions with
//! overlapping id sets queue behind each other instead of deadlocking.
//! Idle entries are pruned when the last holder lets go.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

use orbit_world::EntityId;

type Slots = HashMap<EntityId, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct EntityLocks {
    slots: Arc<Mutex<Slots>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until every id is held by this caller.
    pub async fn acquire<I>(&self, ids: I) -> LockSet
    where
        I: IntoIterator<Item = EntityId>,
    {
        let ids: BTreeSet<EntityId> = ids.into_iter().collect();
        // Built up front so a caller that gives up mid-wait still prunes.
        let mut set = LockSet {
            guards: Vec::with_capacity(ids.len()),
            ids,
            locks: self.clone(),
        };

        for id in &set.ids {
            let slot = {
                let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
                slots.entry(id.clone()).or_default().clone()
            };
            trace!(entity_id = %id, "Waiting for entity lock");
            set.guards.push(slot.lock_owned().await);
        }

        set
    }

    /// Number of ids with a live lock slot (held or awaited).
    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn prune(&self, ids: &BTreeSet<EntityId>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            // Only the map itself still references an idle slot.
            if slots.get(id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
                slots.remove(id);
            }
        }
    }
}

/// Locks held for the lifetime of one transaction.
pub struct LockSet {
    ids: BTreeSet<EntityId>,
    guards: Vec<OwnedMutexGuard<()>>,
    locks: EntityLocks,
}

impl LockSet {
    pub fn contains(&self, id: &EntityId) -> bool {
        self.ids.contains(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &EntityId> {
        self.ids.iter()
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.guards.clear();
        self.locks.prune(&self.ids);
    }
}
