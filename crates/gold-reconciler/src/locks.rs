//! Per-key exclusion
//!
//! At most one guard-then-write sequence may be in flight per natural-key
//! scope. Callers for the same scope wait; different scopes proceed in
//! parallel. Slots are dropped once nobody holds or waits on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of async mutexes keyed by lock scope
#[derive(Debug, Default)]
pub struct KeyLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held exclusion over one scope; released on drop
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    scope: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `scope`
    pub async fn acquire(&self, scope: &str) -> KeyGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(scope.to_string()).or_default())
        };
        let guard = slot.lock_owned().await;

        KeyGuard {
            locks: self,
            scope: scope.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of scopes currently held or awaited
    pub fn active_scopes(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release first so the strong count reflects only the map and waiters
        self.guard.take();

        let mut slots = self
            .locks
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(&self.scope)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.scope);
        }
    }
}
