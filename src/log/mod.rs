//! The append-only fact log.
//!
//! [`FactLog`] is what the store needs from persistence: ordered appends,
//! per-aggregate heads, lazy replay and publish notifications.
//! [`MemFactLog`] keeps everything in memory, [`FileFactLog`] persists to a
//! framed append-only file.

mod file;
mod index;
mod memory;

pub use file::{FileFactLog, FileLogConfig};
pub use index::FactIndex;
pub use memory::MemFactLog;

use crate::error::Result;
use crate::tokens::AggregateState;
use crate::types::{Fact, LogEntry, Sequence};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Identifies a registered publish listener.
pub type ListenerId = u64;

/// Lazy replay of log entries.
pub type EntryIter<'a> = Box<dyn Iterator<Item = Result<LogEntry>> + Send + 'a>;

/// Receives every appended batch.
///
/// Called while the log holds its append lock, so implementations must not
/// block and must not append.
pub trait PublishListener: Send + Sync {
    fn on_publish(&self, entries: &[LogEntry]);
}

/// Coarse prefilter applied while reading the log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Only facts in these namespaces; `None` for all.
    pub namespaces: Option<BTreeSet<String>>,
}

impl LogFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespaces<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: Some(namespaces.into_iter().map(Into::into).collect()),
        }
    }

    pub fn matches(&self, fact: &Fact) -> bool {
        self.namespaces
            .as_ref()
            .map_or(true, |namespaces| namespaces.contains(&fact.ns))
    }
}

/// Persistence collaborator of the store.
pub trait FactLog: Send + Sync {
    /// Append facts in order and notify listeners before returning.
    ///
    /// Fails without appending anything if a fact id is already in the log
    /// or repeated within the batch.
    fn append(&self, facts: Vec<Fact>) -> Result<Vec<LogEntry>>;

    /// Id of the last fact touching `aggregate_id`, optionally only counting
    /// facts in namespace `ns`.
    fn last_fact_id(&self, aggregate_id: Uuid, ns: Option<&str>) -> Result<Option<Uuid>>;

    /// [`FactLog::last_fact_id`] for several aggregates, read consistently.
    fn state_for(&self, aggregate_ids: &[Uuid], ns: Option<&str>) -> Result<AggregateState>;

    /// Entries strictly after fact `after` (or from the start), up to the
    /// head at the time of the call, in sequence order.
    ///
    /// An unknown `after` id is an `InvalidArgument` error.
    fn facts_after(&self, after: Option<Uuid>, filter: &LogFilter) -> Result<EntryIter<'_>>;

    fn fetch_by_id(&self, id: Uuid) -> Result<Option<LogEntry>>;

    /// Sequence of the last entry, if any.
    fn head(&self) -> Option<Sequence>;

    fn register_listener(&self, listener: Arc<dyn PublishListener>) -> ListenerId;

    /// Returns false if the listener was not registered.
    fn unregister_listener(&self, id: ListenerId) -> bool;
}

/// Listener registry shared by the log implementations.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn PublishListener>)>>,
}

impl Listeners {
    pub(crate) fn register(&self, listener: Arc<dyn PublishListener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.listeners.write().push((id, listener));
        id
    }

    pub(crate) fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub(crate) fn notify(&self, entries: &[LogEntry]) {
        if entries.is_empty() {
            return;
        }
        for (_, listener) in self.listeners.read().iter() {
            listener.on_publish(entries);
        }
    }
}

/// Reject ids already in `index` or repeated within `facts`.
pub(crate) fn check_new_ids(index: &FactIndex, facts: &[Fact]) -> Result<()> {
    let mut seen = std::collections::HashSet::with_capacity(facts.len());
    for fact in facts {
        if index.contains(fact.id) || !seen.insert(fact.id) {
            return Err(crate::error::StoreError::DuplicateFactId(fact.id));
        }
    }
    Ok(())
}
