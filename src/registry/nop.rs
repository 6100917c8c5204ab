use super::{RegistrySnapshot, SchemaRegistry};
use crate::error::Result;
use crate::types::Fact;
use std::sync::Arc;
use tracing::warn;

/// Registry used when schema validation is disabled.
///
/// Accepts every fact and knows no transformations.
pub struct NopSchemaRegistry {
    snapshot: Arc<RegistrySnapshot>,
}

impl NopSchemaRegistry {
    pub fn new() -> Self {
        warn!(
            "Schema validation is disabled. Facts are published without validation \
             and no transformations are available."
        );
        Self {
            snapshot: Arc::new(RegistrySnapshot::default()),
        }
    }
}

impl Default for NopSchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry for NopSchemaRegistry {
    fn check(&self, _fact: &Fact) -> Result<()> {
        Ok(())
    }

    fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.clone()
    }

    fn refresh(&self) -> Result<()> {
        Ok(())
    }
}
