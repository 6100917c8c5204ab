//! Fan-out of published facts to live subscriptions.

use super::types::SubscriptionId;
use crate::log::PublishListener;
use crate::types::LogEntry;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Live feed of one subscription.
struct Feed {
    namespaces: BTreeSet<String>,
    sender: Sender<Vec<LogEntry>>,
    /// Set when the feed was dropped for falling behind.
    overflowed: Arc<AtomicBool>,
}

impl Feed {
    /// Entries this feed cares about, or `None` if there are none.
    fn select(&self, entries: &[LogEntry]) -> Option<Vec<LogEntry>> {
        let selected: Vec<LogEntry> = entries
            .iter()
            .filter(|e| self.namespaces.contains(&e.fact.ns))
            .cloned()
            .collect();
        (!selected.is_empty()).then_some(selected)
    }
}

/// Receiving side of a live feed.
pub(crate) struct FeedReceiver {
    pub(crate) batches: Receiver<Vec<LogEntry>>,
    pub(crate) overflowed: Arc<AtomicBool>,
}

/// Distributes appended batches to subscriptions in follow mode.
///
/// Sending never blocks the publisher: a subscription whose buffer is full
/// is dropped and learns about it once it has drained what was buffered.
pub struct SubscriptionManager {
    /// Active feeds by subscription.
    feeds: RwLock<HashMap<SubscriptionId, Feed>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            feeds: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Start buffering entries in `namespaces` for `id`.
    pub(crate) fn register(
        &self,
        id: SubscriptionId,
        namespaces: BTreeSet<String>,
        buffer_size: usize,
    ) -> FeedReceiver {
        let (sender, batches) = bounded(buffer_size.max(1));
        let overflowed = Arc::new(AtomicBool::new(false));
        self.feeds.write().insert(
            id,
            Feed {
                namespaces,
                sender,
                overflowed: overflowed.clone(),
            },
        );
        FeedReceiver {
            batches,
            overflowed,
        }
    }

    /// Stop feeding `id`. Its receiver disconnects once drained.
    pub(crate) fn unregister(&self, id: SubscriptionId) -> bool {
        self.feeds.write().remove(&id).is_some()
    }

    /// Stop feeding every subscription.
    pub(crate) fn close_all(&self) {
        self.feeds.write().clear();
    }

    /// Number of subscriptions in follow mode.
    pub fn subscription_count(&self) -> usize {
        self.feeds.read().len()
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishListener for SubscriptionManager {
    fn on_publish(&self, entries: &[LogEntry]) {
        let mut to_remove = Vec::new();

        {
            let feeds = self.feeds.read();
            for (id, feed) in feeds.iter() {
                let Some(batch) = feed.select(entries) else {
                    continue;
                };
                match feed.sender.try_send(batch) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(subscription = id.0, "Dropping slow subscription");
                        feed.overflowed.store(true, Ordering::SeqCst);
                        to_remove.push(*id);
                    }
                    Err(TrySendError::Disconnected(_)) => to_remove.push(*id),
                }
            }
        }

        if !to_remove.is_empty() {
            let mut feeds = self.feeds.write();
            for id in to_remove {
                feeds.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fact, Sequence, Timestamp};
    use serde_json::json;
    use std::time::Duration;

    fn entry(ns: &str, seq: u64) -> LogEntry {
        LogEntry {
            sequence: Sequence(seq),
            timestamp: Timestamp::now(),
            fact: Arc::new(Fact::builder(ns).build(&json!({})).unwrap()),
        }
    }

    fn namespaces(ns: &[&str]) -> BTreeSet<String> {
        ns.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_unregister() {
        let manager = SubscriptionManager::new();
        let id = manager.next_id();
        let feed = manager.register(id, namespaces(&["a"]), 10);
        assert_eq!(manager.subscription_count(), 1);

        assert!(manager.unregister(id));
        assert_eq!(manager.subscription_count(), 0);
        assert!(feed.batches.recv().is_err());
    }

    #[test]
    fn test_broadcast_to_matching() {
        let manager = SubscriptionManager::new();
        let feed = manager.register(manager.next_id(), namespaces(&["a"]), 10);

        manager.on_publish(&[entry("a", 1), entry("b", 2), entry("a", 3)]);
        manager.on_publish(&[entry("b", 4)]);

        let batch = feed.batches.recv_timeout(Duration::from_millis(100)).unwrap();
        let seqs: Vec<_> = batch.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![Sequence(1), Sequence(3)]);
        assert!(feed.batches.try_recv().is_err());
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let manager = SubscriptionManager::new();
        let feed = manager.register(manager.next_id(), namespaces(&["a"]), 2);

        for seq in 0..10 {
            manager.on_publish(&[entry("a", seq)]);
        }

        assert_eq!(manager.subscription_count(), 0);
        assert!(feed.overflowed.load(Ordering::SeqCst));
        // Buffered batches are still delivered before the disconnect.
        assert_eq!(feed.batches.iter().count(), 2);
    }

    #[test]
    fn test_disconnected_receiver_is_removed() {
        let manager = SubscriptionManager::new();
        let feed = manager.register(manager.next_id(), namespaces(&["a"]), 2);
        drop(feed);

        manager.on_publish(&[entry("a", 1)]);
        assert_eq!(manager.subscription_count(), 0);
    }
}
