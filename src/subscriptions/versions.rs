use super::types::FactSpec;
use crate::types::Fact;
use std::collections::{BTreeSet, HashMap};

/// Versions requested per `ns/type`, built once per subscription.
#[derive(Clone, Debug, Default)]
pub struct RequestedVersions {
    versions: HashMap<String, BTreeSet<u32>>,
}

impl RequestedVersions {
    pub fn from_specs(specs: &[FactSpec]) -> Self {
        let mut versions: HashMap<String, BTreeSet<u32>> = HashMap::new();
        for spec in specs {
            if let (Some(fact_type), Some(version)) = (&spec.fact_type, spec.version) {
                versions
                    .entry(cache_key(&spec.ns, fact_type))
                    .or_default()
                    .insert(version);
            }
        }
        Self { versions }
    }

    pub fn requested(&self, ns: &str, fact_type: &str) -> Option<&BTreeSet<u32>> {
        self.versions.get(&cache_key(ns, fact_type))
    }

    /// The version `fact` has to be transformed to, if any.
    ///
    /// The highest requested version is the target. Nothing is transformed
    /// when no version was requested for the fact's type, when `0` (any) was
    /// requested, or when the fact already has a requested version.
    pub fn target_for(&self, fact: &Fact) -> Option<u32> {
        let requested = self.requested(&fact.ns, fact.fact_type.as_deref()?)?;
        if requested.contains(&0) || requested.contains(&fact.version) {
            return None;
        }
        requested.iter().next_back().copied()
    }
}

fn cache_key(ns: &str, fact_type: &str) -> String {
    format!("{}/{}", ns, fact_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fact(fact_type: &str, version: u32) -> Fact {
        Fact::builder("ns")
            .fact_type(fact_type)
            .version(version)
            .build(&json!({}))
            .unwrap()
    }

    #[test]
    fn test_target_version() {
        let versions = RequestedVersions::from_specs(&[
            FactSpec::ns("ns").fact_type("a").version(2),
            FactSpec::ns("ns").fact_type("a").version(3),
            FactSpec::ns("ns").fact_type("b").version(0),
            FactSpec::ns("ns").fact_type("c"),
            FactSpec::ns("ns").version(5),
        ]);

        assert_eq!(versions.target_for(&fact("a", 1)), Some(3));
        assert_eq!(versions.target_for(&fact("a", 2)), None);
        assert_eq!(versions.target_for(&fact("a", 4)), Some(3));
        assert_eq!(versions.target_for(&fact("b", 7)), None);
        assert_eq!(versions.target_for(&fact("c", 1)), None);
        assert_eq!(versions.requested("ns", "a").map(|v| v.len()), Some(2));

        let untyped = Fact::builder("ns").build(&json!({})).unwrap();
        assert_eq!(versions.target_for(&untyped), None);
    }
}
