use crate::domain::clock::Clock;
use crate::domain::ports::HotCache;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Sweep expired entries once the map grows past this size.
const SWEEP_THRESHOLD: usize = 1_024;

/// In-process implementation of the hot tier. Entries carry an absolute
/// expiry from the injected clock, so tests control time; any remote KV
/// store satisfying [`HotCache`] can replace it without touching the
/// engine.
pub struct InMemoryHotCache {
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl InMemoryHotCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl HotCache for InMemoryHotCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it lazily
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key)
            && entry.expires_at <= now
        {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let expires_at = now
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(300));
        let mut entries = self.entries.write().await;
        // Last writer wins
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        if entries.len() > SWEEP_THRESHOLD {
            let before = entries.len();
            entries.retain(|_, e| e.expires_at > now);
            debug!("Hot cache sweep: {} -> {} entries", before, entries.len());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockClock;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_get_set_round_trip() {
        let clock = Arc::new(MockClock::at(ts("2024-01-16T14:00:00Z")));
        let cache = InMemoryHotCache::new(clock);
        cache
            .set("price:current:AAPL", "payload", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.get("price:current:AAPL").await.unwrap().as_deref(),
            Some("payload")
        );
        assert_eq!(cache.get("price:current:MSFT").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry_honours_clock() {
        let clock = Arc::new(MockClock::at(ts("2024-01-16T14:00:00Z")));
        let cache = InMemoryHotCache::new(clock.clone());
        cache
            .set("k", "v", Duration::from_secs(60))
            .await
            .unwrap();

        clock.advance(ChronoDuration::seconds(59));
        assert!(cache.get("k").await.unwrap().is_some());

        clock.advance(ChronoDuration::seconds(2));
        assert!(cache.get("k").await.unwrap().is_none());
        // The expired entry was evicted, not just hidden
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let clock = Arc::new(MockClock::at(ts("2024-01-16T14:00:00Z")));
        let cache = InMemoryHotCache::new(clock);
        cache.set("k", "old", Duration::from_secs(60)).await.unwrap();
        cache.set("k", "new", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_delete() {
        let clock = Arc::new(MockClock::at(ts("2024-01-16T14:00:00Z")));
        let cache = InMemoryHotCache::new(clock);
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
