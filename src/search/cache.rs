use super::RawCandidate;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CacheEntry {
    candidates: Vec<RawCandidate>,
    expires_at: u64,
}

impl CacheEntry {
    fn new(candidates: Vec<RawCandidate>, ttl: Duration) -> Self {
        Self {
            candidates,
            expires_at: now_secs() + ttl.as_secs(),
        }
    }

    fn is_expired(&self) -> bool {
        now_secs() > self.expires_at
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// TTL cache for raw search results, keyed by query. Repeated lookups for
/// the same track (retries, web UI fetch-then-download) skip the subprocess.
pub struct SearchCache {
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    default_ttl: Duration,
}

impl SearchCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            default_ttl,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Vec<RawCandidate>> {
        let cache = self.cache.read().await;
        match cache.get(key) {
            Some(entry) if !entry.is_expired() => Some(entry.candidates.clone()),
            _ => None,
        }
    }

    pub async fn set(&self, key: String, candidates: Vec<RawCandidate>) {
        let entry = CacheEntry::new(candidates, self.default_ttl);
        let mut cache = self.cache.write().await;
        // Each insert evicts anything expired, so the map stays bounded by
        // the number of live queries.
        cache.retain(|_, existing| !existing.is_expired());
        cache.insert(key, entry);
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<RawCandidate> {
        vec![RawCandidate {
            id: Some("x".to_string()),
            url: None,
            title: Some("t".to_string()),
            duration: Some(100.0),
            view_count: Some(10),
        }]
    }

    #[tokio::test]
    async fn roundtrip_and_miss() {
        let cache = SearchCache::new(Duration::from_secs(60));
        assert!(cache.get("q").await.is_none());

        cache.set("q".to_string(), candidates()).await;
        let hit = cache.get("q").await.unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].id.as_deref(), Some("x"));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_evicted_on_insert() {
        let cache = SearchCache::new(Duration::from_secs(0));
        cache.set("stale".to_string(), candidates()).await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(cache.get("stale").await.is_none());

        // Inserting a fresh entry sweeps out the dead one.
        cache.set("fresh".to_string(), candidates()).await;
        assert_eq!(cache.len().await, 1);
    }
}
