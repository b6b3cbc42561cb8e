//! Per-key trailing-edge debouncing.
//!
//! Each key owns at most one pending timer. A new trigger for the same key
//! cancels the pending one and starts over, so bursts of notifications
//! collapse into a single action fired `delay` after the last of them.

use log::trace;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

struct Pending {
    generation: u64,
    cancel: oneshot::Sender<()>,
}

type PendingMap<K> = Mutex<HashMap<K, Pending>>;

fn lock<K>(pending: &PendingMap<K>) -> MutexGuard<'_, HashMap<K, Pending>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct Debouncer<K> {
    delay: Duration,
    pending: Arc<PendingMap<K>>,
    generation: AtomicU64,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    pub fn new(delay: Duration) -> Self {
        Debouncer {
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Schedules `action` for `key`, replacing whatever was pending for it.
    pub fn trigger<F>(&self, key: K, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel, cancelled) = oneshot::channel();
        let replaced = lock(&self.pending).insert(key.clone(), Pending { generation, cancel });
        if let Some(previous) = replaced {
            trace!("debounce {:?}: restarting timer", key);
            let _ = previous.cancel.send(());
        }

        let pending = self.pending.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled => return,
            }
            // A replacement may have landed between the timer firing and
            // this point; only the newest generation runs.
            let current = {
                let mut map = lock(&pending);
                match map.get(&key) {
                    Some(p) if p.generation == generation => {
                        map.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                action.await;
            }
        });
    }

    /// Drops the pending action for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = lock(&self.pending).remove(key);
        match removed {
            Some(p) => {
                let _ = p.cancel.send(());
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, p) in lock(&self.pending).drain() {
            let _ = p.cancel.send(());
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        for (_, p) in lock(&self.pending).drain() {
            let _ = p.cancel.send(());
        }
    }
}
