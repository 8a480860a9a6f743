// ABOUTME: Per-sandbox mutual exclusion map
// ABOUTME: Serializes record mutations without a global lock

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use std::sync::Arc;

/// Map of `sandbox_id -> lock`. Every mutation of a sandbox record acquires
/// the sandbox's lock first; readers do not lock. Entries are pruned when a
/// record reaches a terminal status so the map does not grow without bound.
#[derive(Default)]
pub struct LockMap {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a sandbox, creating the entry on first use.
    pub async fn acquire(&self, sandbox_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inner = self.inner.lock().expect("lock map poisoned");
            inner
                .entry(sandbox_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the map entry for a terminal sandbox. In-flight holders keep
    /// their Arc; the worst case is two guards briefly covering a record that
    /// every operation already treats as terminal.
    pub fn prune(&self, sandbox_id: &str) {
        let mut inner = self.inner.lock().expect("lock map poisoned");
        inner.remove(sandbox_id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn serializes_same_sandbox() {
        let locks = Arc::new(LockMap::new());
        let in_section = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let in_section = in_section.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("sbx-1").await;
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_sandboxes_are_independent() {
        let locks = LockMap::new();
        let _a = locks.acquire("sbx-a").await;
        // Must not block even while sbx-a is held.
        let _b = locks.acquire("sbx-b").await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn prune_removes_entry() {
        let locks = LockMap::new();
        drop(locks.acquire("sbx-1").await);
        locks.prune("sbx-1");
        assert_eq!(locks.len(), 0);
    }
}
