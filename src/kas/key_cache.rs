//! KAS public key cache
//!
//! Entries are keyed by `(url, algorithm)` and expire a fixed time after
//! insertion. Clones share the same map.

use super::client::KasPublicKey;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::trace;

pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Entry {
    key: KasPublicKey,
    inserted: Instant,
}

#[derive(Debug, Clone)]
pub struct KasKeyCache {
    entries: Arc<RwLock<HashMap<(String, String), Entry>>>,
    ttl: Duration,
}

impl Default for KasKeyCache {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_KEY_TTL)
    }
}

impl KasKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        KasKeyCache {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// A live entry for `(url, algorithm)`
    pub fn get(&self, url: &str, algorithm: &str) -> Option<KasPublicKey> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(&(url.to_string(), algorithm.to_string()))?;
        if entry.inserted.elapsed() >= self.ttl {
            trace!(kas_url = url, algorithm, "cached KAS key expired");
            return None;
        }
        Some(entry.key.clone())
    }

    pub fn insert(&self, key: KasPublicKey) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let ttl = self.ttl;
        entries.retain(|_, e| e.inserted.elapsed() < ttl);
        entries.insert(
            (key.url.clone(), key.algorithm.clone()),
            Entry {
                key,
                inserted: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(url: &str, alg: &str) -> KasPublicKey {
        KasPublicKey {
            url: url.to_string(),
            algorithm: alg.to_string(),
            kid: Some("k1".into()),
            pem: "pem".into(),
        }
    }

    #[test]
    fn test_keyed_by_url_and_algorithm() {
        let cache = KasKeyCache::new();
        cache.insert(key("https://a", "rsa:2048"));
        assert!(cache.get("https://a", "rsa:2048").is_some());
        assert!(cache.get("https://a", "ec:secp256r1").is_none());
        assert!(cache.get("https://b", "rsa:2048").is_none());
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = KasKeyCache::new();
        let other = cache.clone();
        other.insert(key("https://a", "rsa:2048"));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(other.is_empty());
    }

    #[test]
    fn test_entries_expire() {
        let cache = KasKeyCache::with_ttl(Duration::ZERO);
        cache.insert(key("https://a", "rsa:2048"));
        assert!(cache.get("https://a", "rsa:2048").is_none());
    }
}
