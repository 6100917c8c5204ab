//! The registry index: what schemas and transformations exist upstream.

use crate::error::{Result, StoreError};
use crate::transformation::TransformationKey;
use serde::{Deserialize, Serialize};

/// Prefix of index ids that denote generated steps with no source file.
pub const SYNTHETIC_PREFIX: &str = "synthetic/";

/// Listing of all schema and transformation sources.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryIndex {
    #[serde(default)]
    pub schemes: Vec<SchemaSource>,
    #[serde(default)]
    pub transformations: Vec<TransformationSource>,
}

impl RegistryIndex {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StoreError::RegistryIndex(e.to_string()))
    }
}

/// Where to find the schema for one fact type and version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSource {
    pub id: String,
    #[serde(default)]
    pub hash: Option<String>,
    pub ns: String,
    #[serde(rename = "type")]
    pub fact_type: String,
    pub version: u32,
}

impl SchemaSource {
    pub fn new(
        id: impl Into<String>,
        hash: impl Into<String>,
        ns: impl Into<String>,
        fact_type: impl Into<String>,
        version: u32,
    ) -> Self {
        Self {
            id: id.into(),
            hash: Some(hash.into()),
            ns: ns.into(),
            fact_type: fact_type.into(),
            version,
        }
    }

    pub fn key(&self) -> SchemaKey {
        SchemaKey::new(&self.ns, &self.fact_type, self.version)
    }
}

/// Where to find the code of one transformation step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationSource {
    pub id: String,
    #[serde(default)]
    pub hash: Option<String>,
    pub ns: String,
    #[serde(rename = "type")]
    pub fact_type: String,
    pub from: u32,
    pub to: u32,
}

impl TransformationSource {
    pub fn new(
        id: impl Into<String>,
        ns: impl Into<String>,
        fact_type: impl Into<String>,
        hash: Option<String>,
        from: u32,
        to: u32,
    ) -> Self {
        Self {
            id: id.into(),
            hash,
            ns: ns.into(),
            fact_type: fact_type.into(),
            from,
            to,
        }
    }

    /// Generated steps carry no code and are never fetched.
    pub fn is_synthetic(&self) -> bool {
        self.id.starts_with(SYNTHETIC_PREFIX)
    }

    pub fn key(&self) -> TransformationKey {
        TransformationKey::new(&self.ns, &self.fact_type)
    }
}

/// Identifies the schema of one version of a fact type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaKey {
    pub ns: String,
    pub fact_type: String,
    pub version: u32,
}

impl SchemaKey {
    pub fn new(ns: impl Into<String>, fact_type: impl Into<String>, version: u32) -> Self {
        Self {
            ns: ns.into(),
            fact_type: fact_type.into(),
            version,
        }
    }
}
