use super::{Transformation, TransformationChain, TransformationKey};
use crate::error::{Result, StoreError};
use crate::registry::{RegistrySnapshot, SchemaRegistry};
use lru::LruCache;
use parking_lot::Mutex;
use petgraph::algo::astar;
use petgraph::graphmap::DiGraphMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

type ChainKey = (u64, TransformationKey, u32, u32);

/// Resolves transformation chains against the registry.
///
/// Chains are cached per registry generation, so a refresh never mixes
/// steps from two snapshots.
pub struct TransformationChains {
    registry: Arc<dyn SchemaRegistry>,
    cache: Mutex<LruCache<ChainKey, Arc<TransformationChain>>>,
}

impl TransformationChains {
    pub fn new(registry: Arc<dyn SchemaRegistry>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Find the shortest chain of steps from `from` to `to`.
    pub fn resolve(
        &self,
        key: &TransformationKey,
        from: u32,
        to: u32,
    ) -> Result<Arc<TransformationChain>> {
        if from == to {
            return Ok(Arc::new(TransformationChain::identity(key.clone(), from)));
        }

        let snapshot = self.registry.snapshot();
        let cache_key = (snapshot.generation(), key.clone(), from, to);
        if let Some(chain) = self.cache.lock().get(&cache_key) {
            return Ok(chain.clone());
        }

        let chain = Arc::new(build_chain(&snapshot, key, from, to)?);
        debug!(key = %key, from, to, steps = chain.step_ids.len(), "Resolved transformation chain");
        self.cache.lock().put(cache_key, chain.clone());
        Ok(chain)
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

fn build_chain(
    snapshot: &RegistrySnapshot,
    key: &TransformationKey,
    from: u32,
    to: u32,
) -> Result<TransformationChain> {
    let not_found = || StoreError::NoTransformationChainFound {
        key: key.clone(),
        from,
        to,
    };

    let steps = snapshot.transformations(key);
    let mut graph = DiGraphMap::<u32, usize>::new();
    for (i, step) in steps.iter().enumerate() {
        // Placeholders do not lead anywhere.
        if step.from_version == step.to_version {
            continue;
        }
        if !graph.contains_edge(step.from_version, step.to_version) {
            graph.add_edge(step.from_version, step.to_version, i);
        }
    }

    if !graph.contains_node(from) || !graph.contains_node(to) {
        return Err(not_found());
    }

    let (_, path) = astar(&graph, from, |v| v == to, |_| 1, |_| 0).ok_or_else(not_found)?;

    let chosen: Vec<Transformation> = path
        .windows(2)
        .filter_map(|hop| graph.edge_weight(hop[0], hop[1]))
        .map(|&i| steps[i].clone())
        .collect();

    TransformationChain::of(key.clone(), &chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NopSchemaRegistry;
    use crate::types::Fact;
    use parking_lot::RwLock;

    /// Registry whose snapshot can be swapped by the test.
    struct FixedRegistry {
        snapshot: RwLock<Arc<RegistrySnapshot>>,
    }

    impl FixedRegistry {
        fn with(steps: &[(&str, u32, u32)]) -> Arc<Self> {
            let registry = Arc::new(Self {
                snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
            });
            registry.install(steps);
            registry
        }

        fn install(&self, steps: &[(&str, u32, u32)]) {
            let mut snapshot = (**self.snapshot.read()).clone();
            for (id, from, to) in steps {
                snapshot.insert_transformation(Transformation {
                    id: id.to_string(),
                    key: TransformationKey::new("ns", "type"),
                    from_version: *from,
                    to_version: *to,
                    code: Some(format!("function (e) {{ e.v{} = true }}", to)),
                });
            }
            *self.snapshot.write() = Arc::new(snapshot.next_generation());
        }
    }

    impl SchemaRegistry for FixedRegistry {
        fn check(&self, _fact: &Fact) -> Result<()> {
            Ok(())
        }

        fn snapshot(&self) -> Arc<RegistrySnapshot> {
            self.snapshot.read().clone()
        }

        fn refresh(&self) -> Result<()> {
            Ok(())
        }
    }

    fn key() -> TransformationKey {
        TransformationKey::new("ns", "type")
    }

    #[test]
    fn test_identity_needs_no_registry() {
        let chains = TransformationChains::new(Arc::new(NopSchemaRegistry::new()), 10);
        let chain = chains.resolve(&key(), 4, 4).unwrap();
        assert!(chain.is_identity());
    }

    #[test]
    fn test_resolves_shortest_path() {
        let registry = FixedRegistry::with(&[("1-2", 1, 2), ("2-3", 2, 3), ("3-4", 3, 4), ("1-4", 1, 4)]);
        let chains = TransformationChains::new(registry, 10);

        let direct = chains.resolve(&key(), 1, 4).unwrap();
        assert_eq!(direct.step_ids, vec!["1-4"]);

        let stepped = chains.resolve(&key(), 2, 4).unwrap();
        assert_eq!(stepped.step_ids, vec!["2-3", "3-4"]);
        assert_eq!(stepped.from_version, 2);
        assert_eq!(stepped.to_version, 4);
    }

    #[test]
    fn test_downcast_edges() {
        let registry = FixedRegistry::with(&[("1-2", 1, 2), ("2-1", 2, 1)]);
        let chains = TransformationChains::new(registry, 10);
        assert_eq!(chains.resolve(&key(), 2, 1).unwrap().step_ids, vec!["2-1"]);
    }

    #[test]
    fn test_no_path() {
        let registry = FixedRegistry::with(&[("1-2", 1, 2), ("3-4", 3, 4)]);
        let chains = TransformationChains::new(registry, 10);

        for (from, to) in [(1, 4), (2, 1), (1, 9)] {
            let err = chains.resolve(&key(), from, to).unwrap_err();
            assert!(matches!(
                err,
                StoreError::NoTransformationChainFound { from: f, to: t, .. } if f == from && t == to
            ));
        }
        let other = TransformationKey::new("ns", "other");
        assert!(chains.resolve(&other, 1, 2).is_err());
    }

    #[test]
    fn test_cache_follows_generation() {
        let registry = FixedRegistry::with(&[("1-2", 1, 2)]);
        let chains = TransformationChains::new(registry.clone(), 10);
        assert!(chains.resolve(&key(), 1, 3).is_err());

        chains.resolve(&key(), 1, 2).unwrap();
        chains.resolve(&key(), 1, 2).unwrap();
        assert_eq!(chains.cached(), 1);

        registry.install(&[("2-3", 2, 3)]);
        let chain = chains.resolve(&key(), 1, 3).unwrap();
        assert_eq!(chain.step_ids, vec!["1-2", "2-3"]);
    }
}
