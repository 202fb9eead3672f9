//! TTL cache of built proxies
//!
//! A single mutex guards the map. The hot path is one lookup plus an age comparison. An
//! expired entry is removed when it is next looked up, and every insert sweeps the entries of
//! providers that are no longer requested.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    stored: Instant,
}

/// Values keyed `namespace/provider`, served while younger than the TTL
#[derive(Debug)]
pub struct ProxyCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> ProxyCache<V> {
    /// Empty cache whose entries live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cache key for a provider
    pub fn key(namespace: &str, provider: &str) -> String {
        format!("{}/{}", namespace, provider)
    }

    /// Return the entry if it is no older than the TTL; an older entry is dropped
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.stored.elapsed() <= self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store (or replace) an entry and drop every expired one
    pub fn insert(&self, key: String, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.stored.elapsed() <= self.ttl);
        entries.insert(
            key,
            Entry {
                value,
                stored: Instant::now(),
            },
        );
    }

    /// Entries held, expired ones included until they are swept
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = ProxyCache::new(Duration::from_secs(60));
        cache.insert(ProxyCache::<u32>::key("ns", "ova"), 1u32);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cache.get("ns/ova"), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("ns/ova"), None);
        // Expunged on access
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_sweeps_other_expired_entries() {
        let cache = ProxyCache::new(Duration::from_secs(60));
        cache.insert(ProxyCache::<u32>::key("ns", "old"), 1u32);
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.insert(ProxyCache::<u32>::key("ns", "recent"), 2u32);
        tokio::time::advance(Duration::from_secs(31)).await;

        // "ns/old" is never looked up again; the next insert still drops it
        cache.insert(ProxyCache::<u32>::key("other", "ova"), 3u32);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("ns/recent"), Some(2));
        assert_eq!(cache.get("other/ova"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_refreshes_age() {
        let cache = ProxyCache::new(Duration::from_secs(10));
        cache.insert("a/b".to_string(), "first");
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.insert("a/b".to_string(), "second");
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("a/b"), Some("second"));
    }
}
