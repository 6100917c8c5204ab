//! Optimistic read-decide-publish loops.
//!
//! ```ignore
//! let published = store
//!     .lock("accounts")
//!     .on(account_id)
//!     .optimistic()
//!     .retry(5)
//!     .attempt(|| {
//!         let balance = projection.balance(account_id);
//!         if balance < amount {
//!             return Ok(None);
//!         }
//!         Ok(Some(vec![withdrawn(account_id, amount)?]))
//!     })?;
//! ```

use crate::error::{Result, StoreError};
use crate::store::FactStore;
use crate::types::Fact;
use std::thread;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_RETRIES: u32 = 10;

/// Selects the aggregates an operation depends on.
pub struct LockedOperationBuilder<'a> {
    store: &'a FactStore,
    ns: Option<String>,
    aggregate_ids: Vec<Uuid>,
}

impl<'a> LockedOperationBuilder<'a> {
    pub(crate) fn new(store: &'a FactStore, ns: Option<String>) -> Self {
        Self {
            store,
            ns,
            aggregate_ids: Vec::new(),
        }
    }

    pub fn on(mut self, aggregate_id: Uuid) -> Self {
        if !self.aggregate_ids.contains(&aggregate_id) {
            self.aggregate_ids.push(aggregate_id);
        }
        self
    }

    pub fn on_all(self, aggregate_ids: impl IntoIterator<Item = Uuid>) -> Self {
        aggregate_ids.into_iter().fold(self, |builder, id| builder.on(id))
    }

    pub fn optimistic(self) -> OptimisticLock<'a> {
        OptimisticLock {
            store: self.store,
            ns: self.ns,
            aggregate_ids: self.aggregate_ids,
            retries: DEFAULT_RETRIES,
            interval: Duration::ZERO,
        }
    }
}

/// Reruns an operation until it publishes against unchanged state.
pub struct OptimisticLock<'a> {
    store: &'a FactStore,
    ns: Option<String>,
    aggregate_ids: Vec<Uuid>,
    retries: u32,
    interval: Duration,
}

impl<'a> OptimisticLock<'a> {
    /// Extra attempts after the first.
    pub fn retry(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Pause between attempts.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run `operation` until its facts are published.
    ///
    /// `operation` returns the facts to publish, or `None` to give up, in
    /// which case nothing is published and `Ok(false)` is returned. If the
    /// aggregates changed in between, the state is captured again and
    /// `operation` runs again.
    pub fn attempt<F>(self, mut operation: F) -> Result<bool>
    where
        F: FnMut() -> Result<Option<Vec<Fact>>>,
    {
        if self.aggregate_ids.is_empty() {
            return Err(StoreError::InvalidArgument(
                "optimistic lock needs at least one aggregate id".into(),
            ));
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let token = self.store.state_for(&self.aggregate_ids, self.ns.as_deref())?;

            let facts = match operation() {
                Ok(Some(facts)) => facts,
                Ok(None) => {
                    self.store.invalidate(&token);
                    debug!(attempts, "Locked operation aborted");
                    return Ok(false);
                }
                Err(e) => {
                    self.store.invalidate(&token);
                    return Err(e);
                }
            };

            match self.store.publish_if_unchanged(facts, Some(&token)) {
                Ok(true) => {
                    debug!(attempts, "Locked operation published");
                    return Ok(true);
                }
                Ok(false) => self.store.invalidate(&token),
                Err(e) => {
                    self.store.invalidate(&token);
                    return Err(e);
                }
            }

            if attempts > self.retries {
                return Err(StoreError::OptimisticRetriesExceeded(attempts));
            }
            debug!(attempts, "Aggregates changed, retrying");
            if !self.interval.is_zero() {
                thread::sleep(self.interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fact(agg: Uuid) -> Fact {
        Fact::builder("ns").aggregate_id(agg).build(&json!({})).unwrap()
    }

    #[test]
    fn test_publishes_on_first_attempt() {
        let store = FactStore::in_memory();
        let agg = Uuid::new_v4();
        let mut calls = 0;

        let published = store
            .lock("ns")
            .on(agg)
            .optimistic()
            .attempt(|| {
                calls += 1;
                Ok(Some(vec![fact(agg)]))
            })
            .unwrap();

        assert!(published);
        assert_eq!(calls, 1);
        assert!(store.log().last_fact_id(agg, Some("ns")).unwrap().is_some());
    }

    #[test]
    fn test_abort_publishes_nothing() {
        let store = FactStore::in_memory();
        let agg = Uuid::new_v4();

        let published = store.lock("ns").on(agg).optimistic().attempt(|| Ok(None)).unwrap();

        assert!(!published);
        assert_eq!(store.log().head(), None);
    }

    #[test]
    fn test_retries_after_concurrent_change() {
        let store = FactStore::in_memory();
        let agg = Uuid::new_v4();
        let mut calls = 0;

        let published = store
            .lock("ns")
            .on(agg)
            .optimistic()
            .attempt(|| {
                calls += 1;
                if calls == 1 {
                    // Someone else writes between our read and our publish.
                    store.publish(vec![fact(agg)])?;
                }
                Ok(Some(vec![fact(agg)]))
            })
            .unwrap();

        assert!(published);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_gives_up_after_retries() {
        let store = FactStore::in_memory();
        let agg = Uuid::new_v4();
        let mut calls = 0;

        let result = store.lock("ns").on(agg).optimistic().retry(2).attempt(|| {
            calls += 1;
            store.publish(vec![fact(agg)])?;
            Ok(Some(vec![fact(agg)]))
        });

        assert!(matches!(result, Err(StoreError::OptimisticRetriesExceeded(3))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_requires_aggregates() {
        let store = FactStore::in_memory();
        assert!(matches!(
            store.lock("ns").optimistic().attempt(|| Ok(None)),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_operation_error_propagates() {
        let store = FactStore::in_memory();
        let result = store
            .lock_global()
            .on_all([Uuid::new_v4(), Uuid::new_v4()])
            .optimistic()
            .attempt(|| Err(StoreError::InvalidArgument("nope".into())));
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_publish_error_releases_token() {
        let store = FactStore::in_memory();
        let agg = Uuid::new_v4();
        let existing = fact(Uuid::new_v4());
        store.publish(vec![existing.clone()]).unwrap();

        let result = store
            .lock("ns")
            .on(agg)
            .optimistic()
            .attempt(|| Ok(Some(vec![fact(agg), existing.clone()])));

        assert!(matches!(result, Err(StoreError::DuplicateFactId(_))));
        assert_eq!(store.token_count(), 0);
        assert!(store.log().last_fact_id(agg, Some("ns")).unwrap().is_none());
    }

    #[test]
    fn test_finished_attempts_leave_no_tokens() {
        let store = FactStore::in_memory();
        let agg = Uuid::new_v4();

        store.lock("ns").on(agg).optimistic().attempt(|| Ok(Some(vec![fact(agg)]))).unwrap();
        store.lock("ns").on(agg).optimistic().attempt(|| Ok(None)).unwrap();
        assert_eq!(store.token_count(), 0);
    }
}
