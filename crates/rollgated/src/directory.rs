//! Card-to-identity lookup with a TTL cache in front of the store.
//!
//! Negative answers are cached too, so a stream of scans with one stray
//! card does not hammer the store. Source errors are never cached and
//! never answered from a stale entry.

use crate::store::{IdentitySource, StoreError};
use rollgate_core::StudentIdentity;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("identity source: {0}")]
    Source(#[from] StoreError),
    #[error("identity lookup timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub enum Lookup {
    Found(Arc<StudentIdentity>),
    NotFound,
}

struct CachedEntry {
    identity: Option<Arc<StudentIdentity>>,
    fetched_at: Instant,
}

pub struct IdentityDirectory {
    source: Arc<dyn IdentitySource>,
    cache: RwLock<HashMap<String, CachedEntry>>,
    /// Bumped on every invalidation; a fetch that raced one is not cached.
    generation: AtomicU64,
    ttl: Duration,
    timeout: Duration,
}

impl IdentityDirectory {
    pub fn new(source: Arc<dyn IdentitySource>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            ttl,
            timeout,
        }
    }

    /// Resolve a normalized card id.
    ///
    /// A card whose holder has no reference embeddings cannot be verified
    /// and resolves as `NotFound`.
    pub async fn lookup(&self, card_id: &str) -> Result<Lookup, DirectoryError> {
        if let Some(hit) = self.cached(card_id) {
            return Ok(hit);
        }

        let generation = self.generation.load(Ordering::Acquire);
        let fetched = tokio::time::timeout(self.timeout, self.source.fetch(card_id))
            .await
            .map_err(|_| DirectoryError::Timeout(self.timeout))??;

        let identity = match fetched {
            Some(identity) if identity.references.is_empty() => {
                tracing::warn!(
                    card = card_id,
                    student = %identity.student_id,
                    "card holder has no reference faces"
                );
                None
            }
            other => other.map(Arc::new),
        };

        if self.generation.load(Ordering::Acquire) == generation {
            self.store(card_id, identity.clone());
        }
        Ok(match identity {
            Some(identity) => Lookup::Found(identity),
            None => Lookup::NotFound,
        })
    }

    fn cached(&self, card_id: &str) -> Option<Lookup> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(card_id)?;
        if entry.fetched_at.elapsed() >= self.ttl {
            return None;
        }
        Some(match &entry.identity {
            Some(identity) => Lookup::Found(identity.clone()),
            None => Lookup::NotFound,
        })
    }

    fn store(&self, card_id: &str, identity: Option<Arc<StudentIdentity>>) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                card_id.to_string(),
                CachedEntry {
                    identity,
                    fetched_at: Instant::now(),
                },
            );
        }
    }

    /// Drop one card from the cache. Returns whether it was cached.
    pub fn invalidate(&self, card_id: &str) -> bool {
        self.generation.fetch_add(1, Ordering::AcqRel);
        match self.cache.write() {
            Ok(mut cache) => cache.remove(card_id).is_some(),
            Err(_) => false,
        }
    }

    /// Preload every enrolled card. Returns the number cached.
    pub async fn warm(&self) -> Result<usize, DirectoryError> {
        let all = tokio::time::timeout(self.timeout, self.source.fetch_all())
            .await
            .map_err(|_| DirectoryError::Timeout(self.timeout))??;
        let mut loaded = 0;
        for identity in all {
            if identity.references.is_empty() {
                continue;
            }
            let card_id = identity.card_id.clone();
            self.store(&card_id, Some(Arc::new(identity)));
            loaded += 1;
        }
        tracing::info!(cards = loaded, "identity directory warmed");
        Ok(loaded)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    fn directory(store: &Arc<MemoryStore>, ttl_secs: u64) -> IdentityDirectory {
        IdentityDirectory::new(
            store.clone(),
            Duration::from_secs(ttl_secs),
            Duration::from_secs(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_caches_until_ttl() {
        let store = Arc::new(MemoryStore::new());
        store.enroll("A1", "S1", vec![vec![1.0, 0.0]]);
        let dir = directory(&store, 60);

        assert!(matches!(dir.lookup("A1").await.unwrap(), Lookup::Found(_)));
        assert!(matches!(dir.lookup("A1").await.unwrap(), Lookup::Found(_)));
        assert_eq!(store.fetch_count(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        dir.lookup("A1").await.unwrap();
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_card_is_cached_negative() {
        let store = Arc::new(MemoryStore::new());
        let dir = directory(&store, 60);

        assert!(matches!(dir.lookup("ZZ").await.unwrap(), Lookup::NotFound));
        assert!(matches!(dir.lookup("ZZ").await.unwrap(), Lookup::NotFound));
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_no_references_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        store.enroll("A1", "S1", vec![]);
        let dir = directory(&store, 60);
        assert!(matches!(dir.lookup("A1").await.unwrap(), Lookup::NotFound));
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let store = Arc::new(MemoryStore::new());
        let dir = directory(&store, 60);
        assert!(matches!(dir.lookup("A1").await.unwrap(), Lookup::NotFound));

        store.enroll("A1", "S1", vec![vec![1.0, 0.0]]);
        assert!(dir.invalidate("A1"));
        assert!(!dir.invalidate("A1"));
        assert!(matches!(dir.lookup("A1").await.unwrap(), Lookup::Found(_)));
    }

    #[tokio::test]
    async fn test_source_outage_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        store.enroll("A1", "S1", vec![vec![1.0, 0.0]]);
        store.set_available(false);
        let dir = directory(&store, 60);

        assert!(matches!(
            dir.lookup("A1").await,
            Err(DirectoryError::Source(StoreError::Unavailable(_)))
        ));
        assert_eq!(dir.cached_len(), 0);
    }

    #[tokio::test]
    async fn test_warm_skips_cards_without_references() {
        let store = Arc::new(MemoryStore::new());
        store.enroll("A1", "S1", vec![vec![1.0, 0.0]]);
        store.enroll("B2", "S2", vec![]);
        let dir = directory(&store, 60);

        assert_eq!(dir.warm().await.unwrap(), 1);
        dir.lookup("A1").await.unwrap();
        assert_eq!(store.fetch_count(), 0);
    }
}
