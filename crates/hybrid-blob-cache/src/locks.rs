//! Per-key async locks with bounded waits
//!
//! Each lock domain is an explicit instance; two domains never share state.
//! Entries are created on demand and dropped again once the last holder or
//! waiter lets go, so the map only ever contains keys that are in use.

use crate::error::{CacheError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held lock for one key. Releases on drop.
pub struct KeyedLockGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map itself still references an idle lock
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait up to `timeout` for the lock. `Ok(None)` means the wait timed out.
    pub async fn try_lock(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<KeyedLockGuard>> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let lock = self.lock_for(key);
        let acquired = tokio::select! {
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(timeout, lock.clone().lock_owned()) => Some(result.ok()),
        };

        // Build the guard even when we gave up so the map entry gets cleaned
        let mut guard = KeyedLockGuard {
            key: key.to_string(),
            guard: None,
            locks: self.locks.clone(),
        };
        drop(lock);

        match acquired {
            None => Err(CacheError::Cancelled),
            Some(None) => Ok(None),
            Some(Some(owned)) => {
                guard.guard = Some(owned);
                Ok(Some(guard))
            }
        }
    }

    /// Whether someone currently holds the lock for `key`
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys with a holder or waiter
    pub fn active_keys(&self) -> usize {
        self.locks.len()
    }
}
