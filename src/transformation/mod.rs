//! Version-to-version fact transformation.
//!
//! - [`Transformation`]: a single registered step for one fact type.
//! - [`TransformationChain`]: contiguous steps composed into one program.
//! - [`TransformationChains`]: finds and caches chains over a registry snapshot.
//! - [`TransformationCache`]: memoizes transformed facts.
//! - [`TransformationService`]: the above wired together.

mod cache;
mod chains;
mod service;

pub use cache::{InMemTransformationCache, TransformationCache};
pub use chains::TransformationChains;
pub use service::{FactTransformer, TransformationService};

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a transformable fact type, independent of version.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransformationKey {
    pub ns: String,
    pub fact_type: String,
}

impl TransformationKey {
    pub fn new(ns: impl Into<String>, fact_type: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            fact_type: fact_type.into(),
        }
    }
}

impl fmt::Debug for TransformationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransformationKey({}/{})", self.ns, self.fact_type)
    }
}

impl fmt::Display for TransformationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ns, self.fact_type)
    }
}

/// A single transformation step between two versions.
///
/// A step without code leaves the payload untouched and only relabels the
/// version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transformation {
    /// Registry id of the source this step was loaded from.
    pub id: String,
    pub key: TransformationKey,
    pub from_version: u32,
    pub to_version: u32,
    pub code: Option<String>,
}

/// Contiguous transformation steps composed into a single program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformationChain {
    pub key: TransformationKey,
    pub from_version: u32,
    pub to_version: u32,
    /// Ids of the composed steps, in application order.
    pub step_ids: Vec<String>,
    /// Step programs concatenated in order; `None` if no step has code.
    pub composite_code: Option<String>,
}

impl TransformationChain {
    /// The chain from a version to itself.
    pub fn identity(key: TransformationKey, version: u32) -> Self {
        Self {
            key,
            from_version: version,
            to_version: version,
            step_ids: Vec::new(),
            composite_code: None,
        }
    }

    /// Compose ordered steps.
    ///
    /// Fails unless the steps are non-empty, all share `key`, and each step
    /// starts at the version the previous one ended on.
    pub fn of(key: TransformationKey, steps: &[Transformation]) -> Result<Self> {
        let (Some(first), Some(last)) = (steps.first(), steps.last()) else {
            return Err(StoreError::InvalidArgument(
                "a transformation chain needs at least one step".into(),
            ));
        };
        if let Some(foreign) = steps.iter().find(|s| s.key != key) {
            return Err(StoreError::InvalidArgument(format!(
                "step {} belongs to {}, not {}",
                foreign.id, foreign.key, key
            )));
        }
        if let Some(pair) = steps.windows(2).find(|w| w[0].to_version != w[1].from_version) {
            return Err(StoreError::InvalidArgument(format!(
                "steps {} and {} are not contiguous ({} -> {})",
                pair[0].id, pair[1].id, pair[0].to_version, pair[1].from_version
            )));
        }

        let programs: Vec<&str> = steps.iter().filter_map(|s| s.code.as_deref()).collect();
        let composite_code = if programs.is_empty() {
            None
        } else {
            Some(programs.join("\n"))
        };

        Ok(Self {
            key,
            from_version: first.from_version,
            to_version: last.to_version,
            step_ids: steps.iter().map(|s| s.id.clone()).collect(),
            composite_code,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.from_version == self.to_version && self.composite_code.is_none()
    }
}
