use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// In-process keyed locks.
///
/// Entries are weak so that unused keys do not pin their mutex; dead entries
/// are swept periodically.
#[derive(Debug, Default, Clone)]
pub struct MemoryLock {
    locks: Arc<Mutex<HashMap<String, Weak<Mutex<()>>>>>,
    counter: Arc<AtomicUsize>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);

        let mut locks = self.locks.lock().await;
        if count.is_multiple_of(10000) {
            locks.retain(|_, weak| weak.upgrade().is_some());
        }

        let mutex = if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            lock
        } else {
            let lock = Arc::new(Mutex::new(()));
            locks.insert(key.to_string(), Arc::downgrade(&lock));
            lock
        };
        drop(locks);

        mutex.lock_owned().await
    }

    #[cfg(test)]
    pub async fn lock_count(&self) -> usize {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, weak| weak.upgrade().is_some());
        locks.len()
    }
}
