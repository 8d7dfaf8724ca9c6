//! Async exclusion over the artifact names an invocation will touch.
//!
//! Snapshot and restore for one identity share file names, and every restore
//! shares the `decrypted.*` scratch names. Each invocation takes the locks for
//! its names, in sorted order, before touching the filesystem.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Lock table keyed by artifact name.
#[derive(Debug, Clone, Default)]
pub struct ArtifactLocks {
    slots: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Guards held for the duration of one invocation. Dropping the set releases
/// every lock and prunes slots that nobody else is waiting on.
#[derive(Debug)]
pub struct LockSet {
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
    slots: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl LockSet {
    /// Names held by this set, sorted.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.guards.clear();
        for key in &self.keys {
            // The table's own reference is the only one left once every
            // holder and waiter has gone.
            self.slots.remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
        }
    }
}

impl ArtifactLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for every named lock. Keys are deduplicated and taken in sorted
    /// order so two invocations can never hold each other's locks.
    pub async fn acquire<I, S>(&self, keys: I) -> LockSet
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: BTreeSet<String> = keys.into_iter().map(Into::into).collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let slot = self.slots.entry(key.clone()).or_default().clone();
            guards.push(slot.lock_owned().await);
        }
        debug!(keys = ?keys, "artifact locks acquired");
        LockSet {
            keys: keys.into_iter().collect(),
            guards,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Number of names with a live slot.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no slot is live.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether `key` is currently held by some invocation.
    pub fn is_held(&self, key: &str) -> bool {
        self.slots
            .get(key)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_sorts_and_dedups() {
        let locks = ArtifactLocks::new();
        let set = locks.acquire(["b", "a", "b"]).await;
        assert_eq!(set.keys(), ["a".to_string(), "b".to_string()]);
        assert!(locks.is_held("a"));
        drop(set);
        assert!(!locks.is_held("a"));
    }

    #[tokio::test]
    async fn test_overlapping_sets_wait() {
        let locks = ArtifactLocks::new();
        let first = locks.acquire(["idx_u1_v1", "decrypted"]).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _set = locks.acquire(["decrypted"]).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(5), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_disjoint_sets_do_not_block() {
        let locks = ArtifactLocks::new();
        let _a = locks.acquire(["idx_u1_v1"]).await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.acquire(["idx_u2_v1"])).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_slots_are_pruned() {
        let locks = ArtifactLocks::new();
        for n in 0..16 {
            let _set = locks.acquire([format!("idx_u{}_v1", n), "decrypted".to_string()]).await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_slot_survives_while_contended() {
        let locks = ArtifactLocks::new();
        let first = locks.acquire(["decrypted"]).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _set = locks.acquire(["decrypted"]).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(first);
        assert!(!locks.is_empty());
        tokio::time::timeout(Duration::from_secs(5), contender)
            .await
            .unwrap()
            .unwrap();
        assert!(locks.is_empty());
    }

    #[test]
    fn test_unknown_key_is_not_held() {
        assert!(!ArtifactLocks::new().is_held("nothing"));
    }
}
