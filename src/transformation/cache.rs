use crate::types::Fact;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Memoizes transformed facts by `(fact id, version)`.
pub trait TransformationCache: Send + Sync {
    fn get(&self, fact_id: Uuid, version: u32) -> Option<Arc<Fact>>;

    /// Store a transformed fact. Entries that do not describe
    /// `(fact_id, version)` are ignored.
    fn put(&self, fact_id: Uuid, version: u32, fact: Arc<Fact>);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// LRU-bounded in-memory cache.
pub struct InMemTransformationCache {
    entries: Mutex<LruCache<(Uuid, u32), Arc<Fact>>>,
}

impl InMemTransformationCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl Default for InMemTransformationCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl TransformationCache for InMemTransformationCache {
    fn get(&self, fact_id: Uuid, version: u32) -> Option<Arc<Fact>> {
        self.entries.lock().get(&(fact_id, version)).cloned()
    }

    fn put(&self, fact_id: Uuid, version: u32, fact: Arc<Fact>) {
        if fact.id != fact_id || fact.version != version {
            warn!(
                %fact_id,
                version,
                actual_id = %fact.id,
                actual_version = fact.version,
                "Refusing to cache a fact under a foreign key"
            );
            return;
        }
        self.entries.lock().put((fact_id, version), fact);
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn fact(version: u32, n: u64) -> Arc<Fact> {
        Arc::new(
            Fact::builder("ns")
                .fact_type("type")
                .version(version)
                .build(&json!({ "n": n }))
                .unwrap(),
        )
    }

    #[test]
    fn test_get_put() {
        let cache = InMemTransformationCache::new(10);
        let f = fact(2, 1);
        assert!(cache.get(f.id, 2).is_none());

        cache.put(f.id, 2, f.clone());
        assert_eq!(cache.get(f.id, 2).unwrap().id, f.id);
        assert!(cache.get(f.id, 1).is_none());
    }

    #[test]
    fn test_rejects_foreign_entries() {
        let cache = InMemTransformationCache::new(10);
        let a = fact(2, 1);
        let b = fact(2, 2);

        cache.put(a.id, 2, b.clone());
        cache.put(a.id, 3, a.clone());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_eviction() {
        let cache = InMemTransformationCache::new(2);
        let facts: Vec<_> = (0..3).map(|n| fact(1, n)).collect();
        for f in &facts {
            cache.put(f.id, 1, f.clone());
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(facts[0].id, 1).is_none());
    }

    #[test]
    fn test_concurrent_access_has_no_cross_talk() {
        let cache = Arc::new(InMemTransformationCache::new(64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for n in 0..200u64 {
                        let f = fact(2, t * 1000 + n);
                        cache.put(f.id, 2, f.clone());
                        if let Some(hit) = cache.get(f.id, 2) {
                            assert_eq!(hit.payload, f.payload);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.len() <= 64);
    }
}
