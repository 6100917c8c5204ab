use super::{check_new_ids, EntryIter, FactIndex, FactLog, ListenerId, Listeners, LogFilter, PublishListener};
use crate::error::{Result, StoreError};
use crate::tokens::AggregateState;
use crate::types::{Fact, LogEntry, Sequence, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    /// Entry with sequence `n` lives at position `n - 1`.
    entries: Vec<LogEntry>,
    index: FactIndex,
}

/// Fact log held in memory.
#[derive(Default)]
pub struct MemFactLog {
    inner: RwLock<Inner>,
    /// Serializes appends together with their notifications.
    write_lock: Mutex<()>,
    listeners: Listeners,
}

impl MemFactLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FactLog for MemFactLog {
    fn append(&self, facts: Vec<Fact>) -> Result<Vec<LogEntry>> {
        let _lock = self.write_lock.lock();

        let entries = {
            let mut inner = self.inner.write();
            check_new_ids(&inner.index, &facts)?;

            let timestamp = Timestamp::now();
            let mut entries = Vec::with_capacity(facts.len());
            for fact in facts {
                let sequence = Sequence(inner.entries.len() as u64 + 1);
                inner.index.add(&fact, sequence);
                let entry = LogEntry {
                    sequence,
                    timestamp,
                    fact: Arc::new(fact),
                };
                inner.entries.push(entry.clone());
                entries.push(entry);
            }
            entries
        };

        trace!(count = entries.len(), "Appended facts");
        self.listeners.notify(&entries);
        Ok(entries)
    }

    fn last_fact_id(&self, aggregate_id: Uuid, ns: Option<&str>) -> Result<Option<Uuid>> {
        Ok(self.inner.read().index.last_fact_id(aggregate_id, ns))
    }

    fn state_for(&self, aggregate_ids: &[Uuid], ns: Option<&str>) -> Result<AggregateState> {
        let inner = self.inner.read();
        Ok(aggregate_ids
            .iter()
            .map(|id| (*id, inner.index.last_fact_id(*id, ns)))
            .collect())
    }

    fn facts_after(&self, after: Option<Uuid>, filter: &LogFilter) -> Result<EntryIter<'_>> {
        let inner = self.inner.read();
        let start = match after {
            Some(id) => inner
                .index
                .sequence_of(id)
                .ok_or_else(|| StoreError::InvalidArgument(format!("unknown fact id {}", id)))?
                .0 as usize,
            None => 0,
        };
        let end = inner.entries.len();
        drop(inner);

        let filter = filter.clone();
        Ok(Box::new((start..end).filter_map(move |pos| {
            let entry = self.inner.read().entries.get(pos).cloned()?;
            filter.matches(&entry.fact).then_some(Ok(entry))
        })))
    }

    fn fetch_by_id(&self, id: Uuid) -> Result<Option<LogEntry>> {
        let inner = self.inner.read();
        Ok(inner
            .index
            .sequence_of(id)
            .and_then(|seq| inner.entries.get(seq.0 as usize - 1).cloned()))
    }

    fn head(&self) -> Option<Sequence> {
        self.inner.read().entries.last().map(|e| e.sequence)
    }

    fn register_listener(&self, listener: Arc<dyn PublishListener>) -> ListenerId {
        self.listeners.register(listener)
    }

    fn unregister_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }
}
