//! Per-key async locks.
//!
//! [`KeyLocks`] hands out one async mutex per transaction id so that writes to
//! the same id are serialized while writes to different ids proceed in
//! parallel. Entries are created on first use and removed when the last
//! holder or waiter goes away, so the table only holds ids that are in
//! flight. The table itself is guarded by a synchronous mutex that is never
//! held across an `.await`.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Table = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Table of per-key async mutexes.
#[derive(Debug, Default)]
pub struct KeyLocks {
    table: Arc<Table>,
}

impl KeyLocks {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    ///
    /// The returned guard releases the key when dropped. Dropping the future
    /// before it resolves gives up the place in the queue.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let slot = {
            let mut table = self.table.lock();
            let mutex = Arc::clone(table.entry(key.to_string()).or_default());
            Slot { key: key.to_string(), mutex, table: Arc::clone(&self.table) }
        };
        let guard = Arc::clone(&slot.mutex).lock_owned().await;
        KeyGuard { _guard: guard, slot }
    }

    /// Returns the number of keys currently held or awaited.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Returns `true` if no key is held or awaited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

/// Exclusive access to one key.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyGuard {
    // Field order matters: the mutex guard must drop before the slot so the
    // slot sees the final reference count.
    _guard: OwnedMutexGuard<()>,
    slot: Slot,
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.slot.key).finish()
    }
}

/// One holder's or waiter's reference to a table entry.
struct Slot {
    key: String,
    mutex: Arc<AsyncMutex<()>>,
    table: Arc<Table>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        // Two references: the table's and this slot's.
        let unused = Arc::strong_count(&self.mutex) == 2
            && table.get(&self.key).is_some_and(|entry| Arc::ptr_eq(entry, &self.mutex));
        if unused {
            table.remove(&self.key);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = KeyLocks::new();
        {
            let _guard = locks.lock("tx1").await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyLocks::new());
        let guard = locks.lock("tx1").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("tx1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished(), "second holder must wait");
        assert_eq!(locks.len(), 1);

        drop(guard);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _first = locks.lock("tx1").await;
        let second = tokio::time::timeout(Duration::from_secs(1), locks.lock("tx2")).await;
        assert!(second.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_leak() {
        let locks = KeyLocks::new();
        let guard = locks.lock("tx1").await;

        let attempt = tokio::time::timeout(Duration::from_millis(5), locks.lock("tx1")).await;
        assert!(attempt.is_err());

        drop(guard);
        assert!(locks.is_empty());
    }
}
