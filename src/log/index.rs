//! In-memory lookups over the log.

use crate::types::{Fact, Sequence};
use std::collections::HashMap;
use uuid::Uuid;

/// Fact id to sequence, and last fact per aggregate.
#[derive(Debug, Default)]
pub struct FactIndex {
    by_id: HashMap<Uuid, Sequence>,

    /// aggregate id -> last fact touching it, any namespace.
    heads: HashMap<Uuid, Uuid>,

    /// (namespace, aggregate id) -> last fact touching it in that namespace.
    ns_heads: HashMap<(String, Uuid), Uuid>,
}

impl FactIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fact appended at `sequence`. Facts must be added in
    /// sequence order.
    pub fn add(&mut self, fact: &Fact, sequence: Sequence) {
        self.by_id.insert(fact.id, sequence);
        for aggregate_id in &fact.aggregate_ids {
            self.heads.insert(*aggregate_id, fact.id);
            self.ns_heads
                .insert((fact.ns.clone(), *aggregate_id), fact.id);
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn sequence_of(&self, id: Uuid) -> Option<Sequence> {
        self.by_id.get(&id).copied()
    }

    pub fn last_fact_id(&self, aggregate_id: Uuid, ns: Option<&str>) -> Option<Uuid> {
        match ns {
            Some(ns) => self
                .ns_heads
                .get(&(ns.to_string(), aggregate_id))
                .copied(),
            None => self.heads.get(&aggregate_id).copied(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_heads_per_namespace() {
        let agg = Uuid::new_v4();
        let a = Fact::builder("a").aggregate_id(agg).build(&json!({})).unwrap();
        let b = Fact::builder("b").aggregate_id(agg).build(&json!({})).unwrap();

        let mut index = FactIndex::new();
        index.add(&a, Sequence(1));
        index.add(&b, Sequence(2));

        assert_eq!(index.last_fact_id(agg, None), Some(b.id));
        assert_eq!(index.last_fact_id(agg, Some("a")), Some(a.id));
        assert_eq!(index.last_fact_id(agg, Some("b")), Some(b.id));
        assert_eq!(index.last_fact_id(agg, Some("c")), None);
        assert_eq!(index.last_fact_id(Uuid::new_v4(), None), None);

        assert_eq!(index.sequence_of(a.id), Some(Sequence(1)));
        assert!(index.contains(b.id));
        assert_eq!(index.len(), 2);
    }
}
