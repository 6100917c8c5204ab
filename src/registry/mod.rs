//! Schema registry: known schemas and transformation steps.
//!
//! The registry state is an immutable [`RegistrySnapshot`]. A refresh builds
//! a complete new snapshot next to the current one and swaps it in, so
//! readers holding the old `Arc` keep a consistent view.

mod fetch;
mod index;
mod indexed;
mod nop;
mod refresher;
mod validation;

pub use fetch::{FileFetcher, IndexFetcher, LocalFileFetcher, LocalIndexFetcher};
pub use index::{RegistryIndex, SchemaKey, SchemaSource, TransformationSource, SYNTHETIC_PREFIX};
pub use indexed::IndexedSchemaRegistry;
pub use nop::NopSchemaRegistry;
pub use refresher::RegistryRefresher;
pub use validation::Schema;

use crate::error::{Result, StoreError};
use crate::transformation::{Transformation, TransformationKey};
use crate::types::Fact;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Registry configuration.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Validate published facts against registered schemas.
    /// When disabled the registry is a no-op.
    pub validation_enabled: bool,

    /// Accept facts that carry no type or no version without validation.
    pub allow_unvalidated_publish: bool,

    /// Interval of the background refresh.
    pub refresh_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            validation_enabled: true,
            allow_unvalidated_publish: false,
            refresh_interval: Duration::from_secs(15),
        }
    }
}

/// Source of schemas and transformations.
pub trait SchemaRegistry: Send + Sync {
    /// Check a fact against its registered schema.
    fn check(&self, fact: &Fact) -> Result<()>;

    /// True if the fact passes [`SchemaRegistry::check`].
    fn validate(&self, fact: &Fact) -> bool {
        self.check(fact).is_ok()
    }

    /// The current snapshot.
    fn snapshot(&self) -> Arc<RegistrySnapshot>;

    /// Currently known steps for a fact type.
    fn transformations_for(&self, key: &TransformationKey) -> Vec<Transformation> {
        self.snapshot().transformations(key).to_vec()
    }

    /// Pick up upstream changes. On failure the current snapshot stays.
    fn refresh(&self) -> Result<()>;
}

/// Build the registry a configuration asks for.
///
/// With validation enabled the initial fetch happens here and its failure
/// is returned.
pub fn from_config(
    config: &RegistryConfig,
    index_fetcher: Box<dyn IndexFetcher>,
    file_fetcher: Box<dyn FileFetcher>,
) -> Result<Arc<dyn SchemaRegistry>> {
    if config.validation_enabled {
        let registry = IndexedSchemaRegistry::new(index_fetcher, file_fetcher, config.clone())?;
        Ok(Arc::new(registry))
    } else {
        Ok(Arc::new(NopSchemaRegistry::new()))
    }
}

/// Immutable registry contents.
#[derive(Clone, Debug, Default)]
pub struct RegistrySnapshot {
    generation: u64,
    schemas: HashMap<SchemaKey, Arc<Schema>>,
    transformations: HashMap<TransformationKey, Vec<Transformation>>,
    schema_ids: HashSet<String>,
    transformation_ids: HashSet<String>,
}

impl RegistrySnapshot {
    /// Increases with every published change.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn schema(&self, key: &SchemaKey) -> Option<&Arc<Schema>> {
        self.schemas.get(key)
    }

    pub fn transformations(&self, key: &TransformationKey) -> &[Transformation] {
        self.transformations
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn schema_count(&self) -> usize {
        self.schemas.len()
    }

    pub fn transformation_count(&self) -> usize {
        self.transformations.values().map(Vec::len).sum()
    }

    pub fn knows_schema_source(&self, id: &str) -> bool {
        self.schema_ids.contains(id)
    }

    pub fn knows_transformation_source(&self, id: &str) -> bool {
        self.transformation_ids.contains(id)
    }

    pub(crate) fn insert_schema(&mut self, source_id: String, key: SchemaKey, schema: Schema) {
        self.schemas.insert(key, Arc::new(schema));
        self.schema_ids.insert(source_id);
    }

    pub(crate) fn insert_transformation(&mut self, transformation: Transformation) {
        self.transformation_ids.insert(transformation.id.clone());
        self.transformations
            .entry(transformation.key.clone())
            .or_default()
            .push(transformation);
    }

    pub(crate) fn next_generation(mut self) -> Self {
        self.generation += 1;
        self
    }

    /// Validate a fact against this snapshot.
    pub fn check(&self, fact: &Fact, allow_unvalidated: bool) -> Result<()> {
        let invalid = |reason: String| StoreError::InvalidFact {
            id: fact.id,
            reason,
        };

        let fact_type = match fact.fact_type.as_deref() {
            Some(t) if fact.version > 0 => t,
            _ if allow_unvalidated => return Ok(()),
            _ => return Err(invalid("fact has no type or version to validate against".into())),
        };

        let key = SchemaKey::new(&fact.ns, fact_type, fact.version);
        let schema = self
            .schema(&key)
            .ok_or_else(|| invalid(format!("no schema registered for {}/{} v{}", key.ns, key.fact_type, key.version)))?;
        let payload = fact
            .payload_json()
            .map_err(|e| invalid(format!("payload is not JSON: {}", e)))?;

        schema.validate(&payload).map_err(|errors| invalid(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot::default();
        snapshot.insert_schema(
            "s1".into(),
            SchemaKey::new("ns", "type", 1),
            Schema::parse(r#"{"type": "object", "required": ["name"]}"#).unwrap(),
        );
        snapshot.next_generation()
    }

    #[test]
    fn test_check_against_schema() {
        let snapshot = snapshot();
        assert_eq!(snapshot.generation(), 1);

        let good = Fact::builder("ns")
            .fact_type("type")
            .version(1)
            .build(&json!({"name": "x"}))
            .unwrap();
        assert!(snapshot.check(&good, false).is_ok());

        let bad = Fact::builder("ns")
            .fact_type("type")
            .version(1)
            .build(&json!({}))
            .unwrap();
        assert!(matches!(
            snapshot.check(&bad, false),
            Err(StoreError::InvalidFact { .. })
        ));
    }

    #[test]
    fn test_check_unknown_schema_and_unversioned() {
        let snapshot = snapshot();
        let unknown = Fact::builder("ns")
            .fact_type("type")
            .version(2)
            .build(&json!({"name": "x"}))
            .unwrap();
        assert!(snapshot.check(&unknown, true).is_err());

        let unversioned = Fact::builder("ns").fact_type("type").build(&json!({})).unwrap();
        assert!(snapshot.check(&unversioned, false).is_err());
        assert!(snapshot.check(&unversioned, true).is_ok());
    }
}
