//! Registry backed by an index and file fetchers.

use super::fetch::{FileFetcher, IndexFetcher};
use super::index::RegistryIndex;
use super::validation::Schema;
use super::{RegistryConfig, RegistrySnapshot, SchemaRegistry};
use crate::error::{Result, StoreError};
use crate::script::Program;
use crate::transformation::Transformation;
use crate::types::Fact;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info};

/// Schema registry populated from a [`RegistryIndex`].
///
/// Only sources whose id is not yet known are fetched. A refresh that fails
/// halfway leaves the visible snapshot untouched and retries the same index
/// next time.
pub struct IndexedSchemaRegistry {
    index_fetcher: Box<dyn IndexFetcher>,
    file_fetcher: Box<dyn FileFetcher>,
    config: RegistryConfig,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    /// Serializes refreshes; holds an index whose application failed.
    pending: Mutex<Option<RegistryIndex>>,
}

impl IndexedSchemaRegistry {
    /// Create the registry and fetch the initial index.
    pub fn new(
        index_fetcher: Box<dyn IndexFetcher>,
        file_fetcher: Box<dyn FileFetcher>,
        config: RegistryConfig,
    ) -> Result<Self> {
        let registry = Self {
            index_fetcher,
            file_fetcher,
            config,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
            pending: Mutex::new(None),
        };
        registry.refresh_verbose()?;
        Ok(registry)
    }

    /// Refresh, logging the resulting registry size.
    pub fn refresh_verbose(&self) -> Result<()> {
        info!("Fetching schema registry index");
        self.refresh()?;
        let snapshot = self.snapshot();
        info!(
            generation = snapshot.generation(),
            schemas = snapshot.schema_count(),
            transformations = snapshot.transformation_count(),
            "Schema registry loaded"
        );
        Ok(())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn build(&self, current: &RegistrySnapshot, index: &RegistryIndex) -> Result<Option<RegistrySnapshot>> {
        let mut next = current.clone();
        let mut changed = false;

        for source in &index.schemes {
            if next.knows_schema_source(&source.id) {
                continue;
            }
            let text = self.file_fetcher.fetch_schema(source)?;
            let schema = Schema::parse(&text).map_err(|e| {
                StoreError::RegistryIndex(format!("schema {}: {}", source.id, e))
            })?;
            debug!(id = %source.id, ns = %source.ns, fact_type = %source.fact_type, version = source.version, "Registered schema");
            next.insert_schema(source.id.clone(), source.key(), schema);
            changed = true;
        }

        for source in &index.transformations {
            if next.knows_transformation_source(&source.id) {
                continue;
            }
            let code = if source.is_synthetic() {
                None
            } else {
                let code = self.file_fetcher.fetch_transformation(source)?;
                Program::compile(&code).map_err(|e| {
                    StoreError::RegistryIndex(format!("transformation {}: {}", source.id, e))
                })?;
                Some(code)
            };
            debug!(id = %source.id, key = %source.key(), from = source.from, to = source.to, "Registered transformation");
            next.insert_transformation(Transformation {
                id: source.id.clone(),
                key: source.key(),
                from_version: source.from,
                to_version: source.to,
                code,
            });
            changed = true;
        }

        Ok(changed.then_some(next))
    }
}

impl SchemaRegistry for IndexedSchemaRegistry {
    fn check(&self, fact: &Fact) -> Result<()> {
        self.snapshot()
            .check(fact, self.config.allow_unvalidated_publish)
    }

    fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().clone()
    }

    fn refresh(&self) -> Result<()> {
        let mut pending = self.pending.lock();

        let index = match self.index_fetcher.fetch_index()? {
            Some(index) => index,
            None => match pending.take() {
                Some(index) => index,
                None => {
                    debug!("Registry index unchanged");
                    return Ok(());
                }
            },
        };

        let current = self.snapshot();
        match self.build(&current, &index) {
            Ok(Some(next)) => {
                let next = Arc::new(next.next_generation());
                info!(generation = next.generation(), "Registry snapshot updated");
                *self.snapshot.write() = next;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                *pending = Some(index);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SchemaKey, SchemaSource, TransformationSource};
    use crate::transformation::TransformationKey;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves an index once per `publish`, `None` otherwise.
    #[derive(Clone, Default)]
    struct TestIndex {
        next: Arc<Mutex<Option<RegistryIndex>>>,
        always: Arc<Mutex<Option<RegistryIndex>>>,
    }

    impl TestIndex {
        fn always(index: RegistryIndex) -> Self {
            let test = Self::default();
            *test.always.lock() = Some(index);
            test
        }

        fn publish(&self, index: RegistryIndex) {
            *self.next.lock() = Some(index);
        }
    }

    impl IndexFetcher for TestIndex {
        fn fetch_index(&self) -> Result<Option<RegistryIndex>> {
            if let Some(index) = self.next.lock().take() {
                return Ok(Some(index));
            }
            Ok(self.always.lock().clone())
        }
    }

    #[derive(Clone, Default)]
    struct CountingFiles {
        schemas: Arc<AtomicUsize>,
        transformations: Arc<AtomicUsize>,
        failing: Arc<Mutex<HashSet<String>>>,
    }

    impl FileFetcher for CountingFiles {
        fn fetch_schema(&self, source: &SchemaSource) -> Result<String> {
            self.schemas.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().contains(&source.id) {
                return Err(StoreError::RegistryFetch(source.id.clone()));
            }
            Ok(r#"{"type": "object"}"#.to_string())
        }

        fn fetch_transformation(&self, source: &TransformationSource) -> Result<String> {
            self.transformations.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().contains(&source.id) {
                return Err(StoreError::RegistryFetch(source.id.clone()));
            }
            Ok("function (e) { e.upgraded = true }".to_string())
        }
    }

    fn fixture_index() -> RegistryIndex {
        RegistryIndex {
            schemes: vec![
                SchemaSource::new("http://foo/1", "123", "ns", "type", 1),
                SchemaSource::new("http://foo/2", "123", "ns", "type", 2),
            ],
            transformations: vec![
                TransformationSource::new("http://foo/1", "ns", "type", Some("hash".into()), 1, 2),
                TransformationSource::new("synthetic/http://foo/2", "ns", "type", None, 2, 1),
                TransformationSource::new("http://foo/3", "ns", "type2", Some("hash".into()), 1, 2),
            ],
        }
    }

    fn registry(index: TestIndex, files: CountingFiles) -> Result<IndexedSchemaRegistry> {
        IndexedSchemaRegistry::new(Box::new(index), Box::new(files), RegistryConfig::default())
    }

    #[test]
    fn test_initial_fetch() {
        let files = CountingFiles::default();
        let registry = registry(TestIndex::always(fixture_index()), files.clone()).unwrap();
        let snapshot = registry.snapshot();

        assert_eq!(files.schemas.load(Ordering::SeqCst), 2);
        assert_eq!(files.transformations.load(Ordering::SeqCst), 2);

        assert!(snapshot.schema(&SchemaKey::new("ns", "type", 1)).is_some());
        assert!(snapshot.schema(&SchemaKey::new("ns", "type", 2)).is_some());
        assert!(snapshot.schema(&SchemaKey::new("ns", "type", 3)).is_none());
        assert_eq!(snapshot.schema_count(), 2);

        let steps = registry.transformations_for(&TransformationKey::new("ns", "type"));
        assert_eq!(steps.len(), 2);
        let synthetic = steps.iter().find(|s| s.from_version == 2).unwrap();
        assert_eq!(synthetic.code, None);
        assert_eq!(
            registry
                .transformations_for(&TransformationKey::new("ns", "type2"))
                .len(),
            1
        );
    }

    #[test]
    fn test_refresh_unchanged_index_fetches_nothing() {
        let files = CountingFiles::default();
        let registry = registry(TestIndex::always(fixture_index()), files.clone()).unwrap();
        let generation = registry.snapshot().generation();

        registry.refresh().unwrap();
        registry.refresh().unwrap();

        assert_eq!(files.schemas.load(Ordering::SeqCst), 2);
        assert_eq!(files.transformations.load(Ordering::SeqCst), 2);
        assert_eq!(registry.snapshot().generation(), generation);
    }

    #[test]
    fn test_refresh_fetches_only_new_sources() {
        let files = CountingFiles::default();
        let index = TestIndex::default();
        index.publish(fixture_index());
        let registry = registry(index.clone(), files.clone()).unwrap();

        let mut grown = fixture_index();
        grown
            .schemes
            .push(SchemaSource::new("http://foo/3", "123", "ns", "type", 3));
        index.publish(grown);
        registry.refresh().unwrap();

        assert_eq!(files.schemas.load(Ordering::SeqCst), 3);
        assert_eq!(files.transformations.load(Ordering::SeqCst), 2);
        assert!(registry
            .snapshot()
            .schema(&SchemaKey::new("ns", "type", 3))
            .is_some());
    }

    #[test]
    fn test_failed_refresh_keeps_snapshot_and_retries() {
        let files = CountingFiles::default();
        let index = TestIndex::default();
        index.publish(fixture_index());
        let registry = registry(index.clone(), files.clone()).unwrap();
        let before = registry.snapshot();

        let mut grown = fixture_index();
        grown
            .schemes
            .push(SchemaSource::new("http://foo/3", "123", "ns", "type", 3));
        grown.transformations.push(TransformationSource::new(
            "http://foo/4",
            "ns",
            "type",
            None,
            2,
            3,
        ));
        files.failing.lock().insert("http://foo/4".into());
        index.publish(grown);

        assert!(matches!(registry.refresh(), Err(StoreError::RegistryFetch(_))));
        let after = registry.snapshot();
        assert_eq!(after.generation(), before.generation());
        assert!(after.schema(&SchemaKey::new("ns", "type", 3)).is_none());

        // The index fetcher now reports "unchanged"; the failed index is retried.
        files.failing.lock().clear();
        registry.refresh().unwrap();
        let retried = registry.snapshot();
        assert!(retried.generation() > before.generation());
        assert!(retried.schema(&SchemaKey::new("ns", "type", 3)).is_some());
        assert_eq!(
            registry
                .transformations_for(&TransformationKey::new("ns", "type"))
                .len(),
            3
        );
    }

    #[test]
    fn test_initial_fetch_failure_is_fatal() {
        let files = CountingFiles::default();
        files.failing.lock().insert("http://foo/2".into());
        assert!(registry(TestIndex::always(fixture_index()), files).is_err());
    }

    #[test]
    fn test_validate() {
        let registry =
            registry(TestIndex::always(fixture_index()), CountingFiles::default()).unwrap();
        let fact = Fact::builder("ns")
            .fact_type("type")
            .version(1)
            .build(&json!({"a": 1}))
            .unwrap();
        assert!(registry.validate(&fact));

        let array = Fact::builder("ns")
            .fact_type("type")
            .version(1)
            .build(&json!([1]))
            .unwrap();
        assert!(!registry.validate(&array));
    }
}
