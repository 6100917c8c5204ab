//! Core types for the fact store.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Namespace of mark facts.
pub const MARK_NS: &str = "_";

/// Type of mark facts.
pub const MARK_TYPE: &str = "_mark";

/// Position in the global log, assigned at append time. Starts at 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// An immutable published fact.
///
/// The header is a JSON document that carries the identifying fields plus
/// any additional attributes the publisher chose to add. The identifying
/// fields are also kept unpacked for filtering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub id: Uuid,
    pub ns: String,
    pub fact_type: Option<String>,
    /// Schema version of the payload. 0 means unversioned.
    pub version: u32,
    pub aggregate_ids: BTreeSet<Uuid>,
    pub meta: BTreeMap<String, String>,
    /// JSON-encoded header.
    pub header: Vec<u8>,
    /// JSON-encoded payload.
    pub payload: Vec<u8>,
}

/// The identifying header fields, as they appear on the wire.
#[derive(Deserialize)]
struct HeaderFields {
    id: Uuid,
    ns: String,
    #[serde(rename = "type", default)]
    fact_type: Option<String>,
    #[serde(default)]
    version: u32,
    #[serde(rename = "aggIds", default)]
    aggregate_ids: BTreeSet<Uuid>,
    #[serde(default)]
    meta: BTreeMap<String, String>,
}

impl Fact {
    /// Parse a fact from its JSON header and JSON payload.
    pub fn from_json(header: &str, payload: &str) -> Result<Self> {
        let fields: HeaderFields = serde_json::from_str(header)
            .map_err(|e| StoreError::InvalidArgument(format!("invalid fact header: {}", e)))?;
        if fields.ns.is_empty() {
            return Err(StoreError::InvalidArgument(
                "fact header requires a non-empty ns".into(),
            ));
        }
        serde_json::from_str::<Value>(payload)
            .map_err(|e| StoreError::InvalidArgument(format!("invalid fact payload: {}", e)))?;

        Ok(Self {
            id: fields.id,
            ns: fields.ns,
            fact_type: fields.fact_type,
            version: fields.version,
            aggregate_ids: fields.aggregate_ids,
            meta: fields.meta,
            header: header.as_bytes().to_vec(),
            payload: payload.as_bytes().to_vec(),
        })
    }

    /// Start building a fact in the given namespace.
    pub fn builder(ns: impl Into<String>) -> FactBuilder {
        FactBuilder::new(ns)
    }

    /// Create a mark fact with a fresh id.
    pub fn mark() -> Self {
        let id = Uuid::new_v4();
        let header = format!(r#"{{"id":"{}","ns":"{}","type":"{}"}}"#, id, MARK_NS, MARK_TYPE);
        Self {
            id,
            ns: MARK_NS.to_string(),
            fact_type: Some(MARK_TYPE.to_string()),
            version: 0,
            aggregate_ids: BTreeSet::new(),
            meta: BTreeMap::new(),
            header: header.into_bytes(),
            payload: b"{}".to_vec(),
        }
    }

    /// True if this is a mark fact.
    pub fn is_mark(&self) -> bool {
        self.ns == MARK_NS && self.fact_type.as_deref() == Some(MARK_TYPE)
    }

    /// Parse the header document.
    pub fn header_json(&self) -> Result<Value> {
        serde_json::from_slice(&self.header).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    /// Parse the payload document.
    pub fn payload_json(&self) -> Result<Value> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    /// A copy of this fact re-labelled with another version and payload.
    ///
    /// The header's `version` attribute is rewritten; everything else,
    /// including the id, is kept.
    pub fn with_version(&self, version: u32, payload: &Value) -> Result<Self> {
        let mut header = self.header_json()?;
        match header.as_object_mut() {
            Some(obj) => {
                obj.insert("version".to_string(), Value::from(version));
            }
            None => {
                return Err(StoreError::InvalidFormat(format!(
                    "header of fact {} is not an object",
                    self.id
                )))
            }
        }

        Ok(Self {
            version,
            header: serde_json::to_vec(&header)?,
            payload: serde_json::to_vec(payload)?,
            ..self.clone()
        })
    }
}

/// Builder for facts published by this process.
#[derive(Clone, Debug)]
pub struct FactBuilder {
    id: Uuid,
    ns: String,
    fact_type: Option<String>,
    version: u32,
    aggregate_ids: BTreeSet<Uuid>,
    meta: BTreeMap<String, String>,
    extra: Map<String, Value>,
}

impl FactBuilder {
    fn new(ns: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ns: ns.into(),
            fact_type: None,
            version: 0,
            aggregate_ids: BTreeSet::new(),
            meta: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn fact_type(mut self, fact_type: impl Into<String>) -> Self {
        self.fact_type = Some(fact_type.into());
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn aggregate_id(mut self, id: Uuid) -> Self {
        self.aggregate_ids.insert(id);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Add a free-form header attribute (visible to script filters).
    pub fn header_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Build with a serializable payload.
    pub fn build(self, payload: &impl Serialize) -> Result<Fact> {
        let payload = serde_json::to_vec(payload)?;
        self.build_raw(payload)
    }

    /// Build with an already encoded JSON payload.
    pub fn build_raw(self, payload: Vec<u8>) -> Result<Fact> {
        if self.ns.is_empty() {
            return Err(StoreError::InvalidArgument("fact requires a non-empty ns".into()));
        }

        let mut header = self.extra;
        header.insert("id".into(), Value::String(self.id.to_string()));
        header.insert("ns".into(), Value::String(self.ns.clone()));
        if let Some(ref t) = self.fact_type {
            header.insert("type".into(), Value::String(t.clone()));
        }
        if self.version > 0 {
            header.insert("version".into(), Value::from(self.version));
        }
        if !self.aggregate_ids.is_empty() {
            header.insert("aggIds".into(), serde_json::to_value(&self.aggregate_ids)?);
        }
        if !self.meta.is_empty() {
            header.insert("meta".into(), serde_json::to_value(&self.meta)?);
        }

        Ok(Fact {
            id: self.id,
            ns: self.ns,
            fact_type: self.fact_type,
            version: self.version,
            aggregate_ids: self.aggregate_ids,
            meta: self.meta,
            header: serde_json::to_vec(&Value::Object(header))?,
            payload,
        })
    }
}

/// A fact as stored in the log.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    pub fact: Arc<Fact>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sequence_navigation() {
        let seq = Sequence(5);
        assert_eq!(seq.next(), Sequence(6));
        assert_eq!(seq.prev(), Some(Sequence(4)));
        assert_eq!(Sequence(0).prev(), None);
    }

    #[test]
    fn test_from_json() {
        let id = Uuid::new_v4();
        let agg = Uuid::new_v4();
        let header = format!(
            r#"{{"id":"{}","ns":"default","type":"created","version":2,"aggIds":["{}"],"meta":{{"foo":"bar"}},"hit":"me"}}"#,
            id, agg
        );
        let fact = Fact::from_json(&header, r#"{"name":"x"}"#).unwrap();

        assert_eq!(fact.id, id);
        assert_eq!(fact.ns, "default");
        assert_eq!(fact.fact_type.as_deref(), Some("created"));
        assert_eq!(fact.version, 2);
        assert!(fact.aggregate_ids.contains(&agg));
        assert_eq!(fact.meta.get("foo").map(String::as_str), Some("bar"));
        assert_eq!(fact.header_json().unwrap()["hit"], "me");
    }

    #[test]
    fn test_from_json_rejects_bad_header() {
        assert!(Fact::from_json(r#"{"ns":"default"}"#, "{}").is_err());
        assert!(Fact::from_json(r#"{"id":"nope","ns":"default"}"#, "{}").is_err());
        let header = format!(r#"{{"id":"{}","ns":""}}"#, Uuid::new_v4());
        assert!(Fact::from_json(&header, "{}").is_err());
        let header = format!(r#"{{"id":"{}","ns":"x"}}"#, Uuid::new_v4());
        assert!(Fact::from_json(&header, "not json").is_err());
    }

    #[test]
    fn test_builder_header() {
        let agg = Uuid::new_v4();
        let fact = Fact::builder("users")
            .fact_type("UserCreated")
            .version(1)
            .aggregate_id(agg)
            .meta("tenant", "a")
            .header_attribute("origin", json!("import"))
            .build(&json!({"firstName": "Ada"}))
            .unwrap();

        let header = fact.header_json().unwrap();
        assert_eq!(header["id"], fact.id.to_string());
        assert_eq!(header["ns"], "users");
        assert_eq!(header["type"], "UserCreated");
        assert_eq!(header["version"], 1);
        assert_eq!(header["meta"]["tenant"], "a");
        assert_eq!(header["origin"], "import");

        let reparsed = Fact::from_json(
            std::str::from_utf8(&fact.header).unwrap(),
            std::str::from_utf8(&fact.payload).unwrap(),
        )
        .unwrap();
        assert_eq!(reparsed, fact);
    }

    #[test]
    fn test_with_version() {
        let fact = Fact::builder("ns")
            .fact_type("type")
            .version(1)
            .build(&json!({"a": 1}))
            .unwrap();
        let upcast = fact.with_version(2, &json!({"a": 1, "b": 2})).unwrap();

        assert_eq!(upcast.id, fact.id);
        assert_eq!(upcast.version, 2);
        assert_eq!(upcast.header_json().unwrap()["version"], 2);
        assert_eq!(upcast.payload_json().unwrap()["b"], 2);
    }

    #[test]
    fn test_mark() {
        let mark = Fact::mark();
        assert!(mark.is_mark());
        assert_eq!(mark.header_json().unwrap()["type"], MARK_TYPE);
    }
}
