//! Subscription request types.

use crate::error::{Result, StoreError};
use crate::types::{MARK_NS, MARK_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Describes which facts a subscriber wants.
///
/// All fields set on one spec must match. Specs within one request are
/// alternatives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactSpec {
    pub ns: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub fact_type: Option<String>,

    /// Version the subscriber wants to receive; facts in other versions are
    /// transformed. `None` or `0` accepts any version as published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,

    /// Predicate `function (header)` or `function (header, payload)`.
    #[serde(rename = "jsFilterScript", default, skip_serializing_if = "Option::is_none")]
    pub script_filter: Option<String>,

    /// The fact must carry every one of these aggregate ids.
    #[serde(rename = "aggIds", default, skip_serializing_if = "Option::is_none")]
    pub aggregate_ids: Option<BTreeSet<Uuid>>,
}

impl FactSpec {
    pub fn ns(ns: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            fact_type: None,
            version: None,
            meta: BTreeMap::new(),
            script_filter: None,
            aggregate_ids: None,
        }
    }

    /// Matches mark facts.
    pub fn for_mark() -> Self {
        Self::ns(MARK_NS).fact_type(MARK_TYPE)
    }

    pub fn fact_type(mut self, fact_type: impl Into<String>) -> Self {
        self.fact_type = Some(fact_type.into());
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn script_filter(mut self, source: impl Into<String>) -> Self {
        self.script_filter = Some(source.into());
        self
    }

    pub fn aggregate_id(mut self, id: Uuid) -> Self {
        self.aggregate_ids.get_or_insert_with(BTreeSet::new).insert(id);
        self
    }
}

fn default_true() -> bool {
    true
}

/// What to subscribe to and how.
///
/// ```ignore
/// let request = SubscriptionRequest::follow(FactSpec::ns("users").fact_type("UserCreated"))
///     .from(last_seen)
///     .max_batch_delay(Duration::from_millis(20));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    specs: Vec<FactSpec>,

    #[serde(default)]
    continuous: bool,

    #[serde(default)]
    ephemeral: bool,

    #[serde(default = "default_true")]
    marks: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    starting_after: Option<Uuid>,

    #[serde(rename = "maxBatchDelayInMs", default)]
    max_batch_delay_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    debug_info: Option<String>,
}

impl SubscriptionRequest {
    fn new(spec: FactSpec, continuous: bool) -> Self {
        Self {
            specs: vec![spec],
            continuous,
            ephemeral: false,
            marks: true,
            starting_after: None,
            max_batch_delay_ms: 0,
            debug_info: None,
        }
    }

    /// Replay matching facts, then complete.
    pub fn catchup(spec: FactSpec) -> Self {
        Self::new(spec, false)
    }

    /// Replay matching facts, then keep delivering new ones.
    pub fn follow(spec: FactSpec) -> Self {
        Self::new(spec, true)
    }

    /// Add an alternative spec.
    pub fn also(mut self, spec: FactSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Start after the given fact.
    pub fn from(mut self, fact_id: Uuid) -> Self {
        self.starting_after = Some(fact_id);
        self
    }

    /// Start at the beginning of the log.
    pub fn since_inception(mut self) -> Self {
        self.starting_after = None;
        self
    }

    /// Synthesize a mark at the end of catchup if none was delivered.
    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    /// Do not deliver mark facts.
    pub fn without_marks(mut self) -> Self {
        self.marks = false;
        self
    }

    pub fn max_batch_delay(mut self, delay: Duration) -> Self {
        self.max_batch_delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// Free text attached to log lines about this subscription.
    pub fn debug_info(mut self, info: impl Into<String>) -> Self {
        self.debug_info = Some(info.into());
        self
    }

    pub fn specs(&self) -> &[FactSpec] {
        &self.specs
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn marks(&self) -> bool {
        self.marks
    }

    pub fn starting_after(&self) -> Option<Uuid> {
        self.starting_after
    }

    pub fn max_batch_delay_duration(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }

    pub fn debug_info_text(&self) -> Option<&str> {
        self.debug_info.as_deref()
    }

    /// The requested specs plus the mark spec when marks are wanted.
    pub fn effective_specs(&self) -> Vec<FactSpec> {
        let mut specs = self.specs.clone();
        if self.marks && !specs.iter().any(|s| *s == FactSpec::for_mark()) {
            specs.push(FactSpec::for_mark());
        }
        specs
    }

    /// Fail fast on requests that can never be served.
    pub fn validate(&self) -> Result<()> {
        if self.specs.is_empty() {
            return Err(StoreError::InvalidArgument(
                "a subscription needs at least one fact spec".into(),
            ));
        }
        if let Some(spec) = self.specs.iter().find(|s| s.ns.is_empty()) {
            return Err(StoreError::InvalidArgument(format!(
                "fact spec without namespace: {:?}",
                spec
            )));
        }
        Ok(())
    }
}
