//! Keyed async locks serializing work per stock and per user

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

type Slot = Arc<AsyncMutex<()>>;

/// One async mutex per key, created on demand and dropped once no guard or
/// waiter references it.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<Uuid, Slot>>,
}

/// Exclusive access to one key. Releasing the last reference prunes the entry.
pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<Uuid, Slot>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for exclusive access to `key`; released when the guard drops.
    pub async fn acquire(&self, key: Uuid) -> KeyGuard<'_> {
        let slot = self.slots().entry(key).or_default().clone();
        let guard = slot.lock_owned().await;
        KeyGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    fn release(&self, key: Uuid) {
        let mut slots = self.slots();
        if slots.get(&key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(&key);
        }
    }

    /// Keys currently held or awaited.
    pub fn tracked(&self) -> usize {
        self.slots().len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(self.key);
    }
}
