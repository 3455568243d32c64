use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-key coalescing of concurrent cache misses.
///
/// At most one caller per key runs the expensive lookup at a time; the
/// others queue on the key's lock and, once admitted, re-check the hot
/// cache the leader has just populated. This prevents a thundering herd of
/// provider calls for one ticker without holding any global lock across
/// I/O.
pub struct SingleFlight {
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the flight lock for `key`. The guard must be held for the
    /// whole miss path (re-check cache, fetch, populate).
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let cell = {
            let mut map = self.inflight.lock().await;
            // Drop locks nobody is waiting on anymore
            map.retain(|_, cell| Arc::strong_count(cell) > 1);
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        cell.lock_owned().await
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}
