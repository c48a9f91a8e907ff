use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::debug;

type SlotMap<K> = HashMap<K, Arc<Mutex<()>>>;

/// Per-key async mutexes with bounded acquisition. Slots are created on
/// demand and dropped again once nobody holds or waits on them.
pub struct KeyedLocks<K> {
    slots: Arc<StdMutex<SlotMap<K>>>,
    timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeout {
    pub waited: Duration,
}

impl<K> KeyedLocks<K>
where
    K: Hash + Eq + Clone + Debug + Send + 'static,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: Arc::new(StdMutex::new(HashMap::new())),
            timeout,
        }
    }

    pub async fn acquire(&self, key: K) -> Result<KeyedGuard<K>, LockTimeout> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        match timeout(self.timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(KeyedGuard {
                key,
                guard: Some(guard),
                slots: self.slots.clone(),
            }),
            Err(_) => {
                debug!(key = ?key, waited_ms = self.timeout.as_millis() as u64, "Lock wait timed out");
                // Our clone of the slot goes away here; prune if idle.
                prune(&self.slots, &key);
                Err(LockTimeout {
                    waited: self.timeout,
                })
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of keys currently held or waited on.
    pub fn active(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn prune<K: Hash + Eq>(slots: &StdMutex<SlotMap<K>>, key: &K) {
    let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(slot) = slots.get(key) {
        // The map's own reference is the only one left.
        if Arc::strong_count(slot) == 1 {
            slots.remove(key);
        }
    }
}

pub struct KeyedGuard<K: Hash + Eq> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<StdMutex<SlotMap<K>>>,
}

impl<K: Hash + Eq> KeyedGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Hash + Eq> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        // Release the mutex (and its Arc) before checking whether the slot is idle.
        self.guard.take();
        prune(&self.slots, &self.key);
    }
}
