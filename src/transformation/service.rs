use super::{TransformationCache, TransformationChain, TransformationChains, TransformationKey};
use crate::error::{Result, StoreError};
use crate::script::ScriptEngine;
use crate::types::Fact;
use std::sync::Arc;
use tracing::trace;

/// Applies chains to facts.
pub struct FactTransformer {
    scripts: Arc<ScriptEngine>,
}

impl FactTransformer {
    pub fn new(scripts: Arc<ScriptEngine>) -> Self {
        Self { scripts }
    }

    /// Transform `fact` along `chain`.
    ///
    /// The result keeps the fact's id and carries the chain's target version.
    pub fn apply(&self, fact: &Fact, chain: &TransformationChain) -> Result<Fact> {
        if chain.is_identity() {
            return Ok(fact.clone());
        }
        if fact.version != chain.from_version {
            return Err(StoreError::InvalidArgument(format!(
                "fact {} has version {}, chain starts at {}",
                fact.id, fact.version, chain.from_version
            )));
        }

        let failed = |reason: String| StoreError::TransformationFailed {
            id: fact.id,
            reason,
        };

        let payload = fact.payload_json().map_err(|e| failed(e.to_string()))?;
        let payload = match &chain.composite_code {
            Some(code) => self
                .scripts
                .transform(code, payload)
                .map_err(|e| failed(e.to_string()))?,
            None => payload,
        };
        fact.with_version(chain.to_version, &payload)
    }
}

/// Chain resolution, transformation and caching wired together.
pub struct TransformationService {
    chains: TransformationChains,
    transformer: FactTransformer,
    cache: Arc<dyn TransformationCache>,
}

impl TransformationService {
    pub fn new(
        chains: TransformationChains,
        transformer: FactTransformer,
        cache: Arc<dyn TransformationCache>,
    ) -> Self {
        Self {
            chains,
            transformer,
            cache,
        }
    }

    pub fn chains(&self) -> &TransformationChains {
        &self.chains
    }

    /// The fact as it looks in version `target`.
    pub fn transform_to(&self, fact: &Arc<Fact>, target: u32) -> Result<Arc<Fact>> {
        if fact.version == target {
            return Ok(fact.clone());
        }
        let Some(fact_type) = fact.fact_type.as_deref() else {
            return Err(StoreError::InvalidArgument(format!(
                "fact {} has no type and cannot be transformed",
                fact.id
            )));
        };

        if let Some(hit) = self.cache.get(fact.id, target) {
            return Ok(hit);
        }

        let key = TransformationKey::new(&fact.ns, fact_type);
        let chain = self.chains.resolve(&key, fact.version, target)?;
        let transformed = Arc::new(self.transformer.apply(fact, &chain)?);
        trace!(fact_id = %fact.id, from = fact.version, to = target, "Transformed fact");

        self.cache.put(fact.id, target, transformed.clone());
        Ok(transformed)
    }
}
