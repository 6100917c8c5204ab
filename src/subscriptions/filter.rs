//! Matching facts against fact specs.

use super::types::FactSpec;
use crate::error::Result;
use crate::log::LogFilter;
use crate::script::{Predicate, ScriptEngine};
use crate::types::Fact;
use serde_json::Value;
use std::collections::BTreeSet;

struct CompiledSpec {
    spec: FactSpec,
    predicate: Option<Predicate>,
}

impl CompiledSpec {
    fn matches_static(&self, fact: &Fact) -> bool {
        let spec = &self.spec;
        if spec.ns != fact.ns {
            return false;
        }
        if let Some(fact_type) = &spec.fact_type {
            if fact.fact_type.as_ref() != Some(fact_type) {
                return false;
            }
        }
        if !spec
            .meta
            .iter()
            .all(|(k, v)| fact.meta.get(k) == Some(v))
        {
            return false;
        }
        if let Some(ids) = &spec.aggregate_ids {
            if !ids.is_subset(&fact.aggregate_ids) {
                return false;
            }
        }
        true
    }
}

/// Parsed documents of the fact under test, decoded at most once.
struct Documents<'a> {
    fact: &'a Fact,
    header: Option<Value>,
    payload: Option<Value>,
}

impl<'a> Documents<'a> {
    fn header(&mut self) -> Result<&Value> {
        if self.header.is_none() {
            self.header = Some(self.fact.header_json()?);
        }
        let header: &Value = self.header.get_or_insert(Value::Null);
        Ok(header)
    }

    fn both(&mut self) -> Result<(&Value, &Value)> {
        if self.header.is_none() {
            self.header = Some(self.fact.header_json()?);
        }
        if self.payload.is_none() {
            self.payload = Some(self.fact.payload_json()?);
        }
        let header: &Value = self.header.get_or_insert(Value::Null);
        let payload: &Value = self.payload.get_or_insert(Value::Null);
        Ok((header, payload))
    }
}

/// OR-combination of compiled fact specs.
pub struct FactFilter {
    specs: Vec<CompiledSpec>,
}

impl FactFilter {
    /// Compile every spec's script filter up front.
    pub fn new(specs: Vec<FactSpec>, scripts: &ScriptEngine) -> Result<Self> {
        let specs = specs
            .into_iter()
            .map(|spec| {
                let predicate = match &spec.script_filter {
                    Some(source) => Some(scripts.predicate(source)?),
                    None => None,
                };
                Ok(CompiledSpec { spec, predicate })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { specs })
    }

    /// Every namespace any spec can match.
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.specs.iter().map(|s| s.spec.ns.clone()).collect()
    }

    /// Log prefilter for [`FactFilter::namespaces`].
    pub fn log_filter(&self) -> LogFilter {
        LogFilter {
            namespaces: Some(self.namespaces()),
        }
    }

    /// True if any spec matches. Script failures are errors.
    pub fn test(&self, fact: &Fact) -> Result<bool> {
        let mut docs = Documents {
            fact,
            header: None,
            payload: None,
        };

        for compiled in &self.specs {
            if !compiled.matches_static(fact) {
                continue;
            }
            let matched = match &compiled.predicate {
                None => true,
                Some(predicate) if predicate.wants_payload() => {
                    let (header, payload) = docs.both()?;
                    predicate.test(header, Some(payload))?
                }
                Some(predicate) => predicate.test(docs.header()?, None)?,
            };
            if matched {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use serde_json::json;
    use uuid::Uuid;

    fn filter(specs: Vec<FactSpec>) -> FactFilter {
        FactFilter::new(specs, &ScriptEngine::default()).unwrap()
    }

    #[test]
    fn test_namespace_and_type() {
        let f = filter(vec![FactSpec::ns("ns").fact_type("a")]);
        let a = Fact::builder("ns").fact_type("a").build(&json!({})).unwrap();
        let b = Fact::builder("ns").fact_type("b").build(&json!({})).unwrap();
        let other = Fact::builder("other").fact_type("a").build(&json!({})).unwrap();

        assert!(f.test(&a).unwrap());
        assert!(!f.test(&b).unwrap());
        assert!(!f.test(&other).unwrap());
    }

    #[test]
    fn test_specs_are_alternatives() {
        let f = filter(vec![FactSpec::ns("a"), FactSpec::ns("b")]);
        assert!(f.test(&Fact::builder("b").build(&json!({})).unwrap()).unwrap());
        assert_eq!(f.log_filter(), LogFilter::namespaces(["a", "b"]));
    }

    #[test]
    fn test_required_meta() {
        let f = filter(vec![FactSpec::ns("ns").meta("foo", "bar")]);
        let with = Fact::builder("ns").meta("foo", "bar").meta("x", "y").build(&json!({})).unwrap();
        let wrong = Fact::builder("ns").meta("foo", "baz").build(&json!({})).unwrap();
        let without = Fact::builder("ns").build(&json!({})).unwrap();

        assert!(f.test(&with).unwrap());
        assert!(!f.test(&wrong).unwrap());
        assert!(!f.test(&without).unwrap());
    }

    #[test]
    fn test_aggregate_ids() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let f = filter(vec![FactSpec::ns("ns").aggregate_id(a)]);
        let both = Fact::builder("ns").aggregate_id(a).aggregate_id(b).build(&json!({})).unwrap();
        let only_b = Fact::builder("ns").aggregate_id(b).build(&json!({})).unwrap();

        assert!(f.test(&both).unwrap());
        assert!(!f.test(&only_b).unwrap());
    }

    #[test]
    fn test_header_script() {
        let f = filter(vec![FactSpec::ns("ns").script_filter("function (h,e){ return (h.hit=='me')}")]);
        let hit = Fact::builder("ns")
            .header_attribute("hit", json!("me"))
            .build(&json!({}))
            .unwrap();
        let miss = Fact::builder("ns")
            .header_attribute("hit", json!("you"))
            .build(&json!({}))
            .unwrap();

        assert!(f.test(&hit).unwrap());
        assert!(!f.test(&miss).unwrap());
    }

    #[test]
    fn test_payload_script() {
        let f = filter(vec![FactSpec::ns("ns").script_filter("function (h, e) { return e.amount > 10 }")]);
        assert!(f.test(&Fact::builder("ns").build(&json!({"amount": 11})).unwrap()).unwrap());
        assert!(!f.test(&Fact::builder("ns").build(&json!({"amount": 3})).unwrap()).unwrap());
    }

    #[test]
    fn test_script_errors() {
        assert!(matches!(
            FactFilter::new(
                vec![FactSpec::ns("ns").script_filter("function (h) { return h. }")],
                &ScriptEngine::default()
            ),
            Err(StoreError::Script(_))
        ));

        let f = filter(vec![FactSpec::ns("ns").script_filter("function (h) { return h.a.b == 1 }")]);
        assert!(f.test(&Fact::builder("ns").build(&json!({})).unwrap()).is_err());
    }
}
