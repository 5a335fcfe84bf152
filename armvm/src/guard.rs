//! Serial access guard.
//!
//! A process-local table of async mutexes keyed by [`LockKey`]. At most one
//! [`ResourceLease`] per key exists at a time; dropping the lease releases
//! the key and removes idle entries from the table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::identity::LockKey;

type Slots = HashMap<LockKey, Arc<AsyncMutex<()>>>;

#[derive(Debug, Clone, Default)]
pub struct LockTable {
    slots: Arc<Mutex<Slots>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &LockKey) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.clone()).or_default().clone()
    }

    /// Wait until `key` is free and take it.
    pub async fn acquire(&self, key: LockKey) -> ResourceLease {
        let slot = self.slot(&key);
        let guard = slot.lock_owned().await;
        debug!(key = %key, "Acquired lock");
        ResourceLease {
            key,
            table: self.clone(),
            guard: Some(guard),
        }
    }

    /// Take `key` if nobody holds it.
    pub fn try_acquire(&self, key: LockKey) -> Option<ResourceLease> {
        let slot = self.slot(&key);
        match slot.try_lock_owned() {
            Ok(guard) => Some(ResourceLease {
                key,
                table: self.clone(),
                guard: Some(guard),
            }),
            Err(_) => None,
        }
    }

    pub fn is_held(&self, key: &LockKey) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the entry for `key` when only the table references it.
    fn prune(&self, key: &LockKey) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(key);
        }
    }
}

/// Exclusive access to one key, released on drop.
#[derive(Debug)]
pub struct ResourceLease {
    key: LockKey,
    table: LockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ResourceLease {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        // the guard holds a reference to the slot, release it before pruning
        self.guard.take();
        self.table.prune(&self.key);
        debug!(key = %self.key, "Released lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key(name: &str) -> LockKey {
        LockKey::new("azurerm_virtual_machine", name)
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let table = LockTable::new();
        let lease = table.acquire(key("vm")).await;
        assert!(table.is_held(&key("vm")));
        assert!(table.try_acquire(key("vm")).is_none());

        drop(lease);
        assert!(!table.is_held(&key("vm")));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let table = LockTable::new();
        let _a = table.acquire(key("a")).await;
        let b = table.try_acquire(key("b"));
        assert!(b.is_some());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_same_kind_and_name_conflict_only() {
        let table = LockTable::new();
        let _vm = table.acquire(key("x")).await;
        let disk = LockKey::new("azurerm_managed_disk", "x");
        assert!(table.try_acquire(disk).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_serializes_holders() {
        let table = LockTable::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let active = active.clone();
                let max_active = max_active.clone();
                tokio::spawn(async move {
                    let _lease = table.acquire(key("vm")).await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry_alive() {
        let table = LockTable::new();
        let first = table.acquire(key("vm")).await;

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.acquire(key("vm")).await })
        };
        tokio::task::yield_now().await;

        drop(first);
        let second = waiter.await.unwrap();
        assert!(table.is_held(&key("vm")));
        drop(second);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_is_woken_on_release() {
        let table = LockTable::new();
        let first = table.acquire(key("vm")).await;

        let mut waiter = tokio_test::task::spawn(table.acquire(key("vm")));
        tokio_test::assert_pending!(waiter.poll());

        drop(first);
        assert!(waiter.is_woken());
        let second = tokio_test::assert_ready!(waiter.poll());
        assert_eq!(second.key(), &key("vm"));
    }
}
