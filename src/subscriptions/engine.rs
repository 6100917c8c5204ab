//! Per-subscription worker: catchup, then follow or complete.

use super::filter::FactFilter;
use super::manager::{FeedReceiver, SubscriptionManager};
use super::observer::FactObserver;
use super::types::{SubscriptionId, SubscriptionRequest};
use super::versions::RequestedVersions;
use crate::error::{Result, StoreError};
use crate::log::FactLog;
use crate::script::ScriptEngine;
use crate::transformation::TransformationService;
use crate::types::{Fact, LogEntry, Sequence};
use crossbeam_channel::RecvTimeoutError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything a subscription worker needs from the store.
#[derive(Clone)]
pub(crate) struct EngineContext {
    pub(crate) log: Arc<dyn FactLog>,
    pub(crate) manager: Arc<SubscriptionManager>,
    pub(crate) transformations: Arc<TransformationService>,
    pub(crate) scripts: Arc<ScriptEngine>,
    pub(crate) strict_transformations: bool,
    pub(crate) buffer_size: usize,
}

/// Handle to a running subscription.
///
/// Dropping the handle cancels the subscription.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    id: SubscriptionId,
    cancelled: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    skipped: Arc<AtomicU64>,
    manager: Arc<SubscriptionManager>,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stop delivering. Deliveries already made stay made.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.manager.unregister(self.id);
            debug!(subscription = self.id.0, "Subscription cancelled");
        }
    }

    /// Matching facts left out so far because they could not be transformed
    /// to the requested version.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    /// True once the worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait for the worker to stop.
    ///
    /// A catchup subscription stops after completing; a follow subscription
    /// only after an error or a `cancel` from another thread.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Validate `request`, then start its worker.
///
/// Follow subscriptions are registered for live delivery before the catchup
/// reads the log, so nothing published in between is lost.
pub(crate) fn start(
    ctx: &EngineContext,
    request: SubscriptionRequest,
    observer: Box<dyn FactObserver>,
) -> Result<Subscription> {
    request.validate()?;
    let filter = FactFilter::new(request.effective_specs(), &ctx.scripts)?;
    let versions = RequestedVersions::from_specs(request.specs());

    let starting_after = match request.starting_after() {
        Some(fact_id) => Some(
            ctx.log
                .fetch_by_id(fact_id)?
                .ok_or_else(|| StoreError::InvalidArgument(format!("unknown fact id {}", fact_id)))?
                .sequence,
        ),
        None => None,
    };

    let id = ctx.manager.next_id();
    let feed = request
        .is_continuous()
        .then(|| ctx.manager.register(id, filter.namespaces(), ctx.buffer_size));

    info!(
        subscription = id.0,
        continuous = request.is_continuous(),
        ephemeral = request.is_ephemeral(),
        debug_info = request.debug_info_text().unwrap_or(""),
        "Subscribed"
    );

    let cancelled = Arc::new(AtomicBool::new(false));
    let closed = Arc::new(AtomicBool::new(false));
    let skipped = Arc::new(AtomicU64::new(0));
    let worker = Worker {
        id,
        request,
        filter,
        versions,
        starting_after,
        ctx: ctx.clone(),
        cancelled: cancelled.clone(),
        skipped: skipped.clone(),
    };

    let worker_closed = closed.clone();
    let handle = thread::Builder::new()
        .name(format!("subscription-{}", id.0))
        .spawn(move || worker.run(feed, observer, worker_closed));

    match handle {
        Ok(handle) => Ok(Subscription {
            id,
            cancelled,
            closed,
            skipped,
            manager: ctx.manager.clone(),
            handle: Some(handle),
        }),
        Err(e) => {
            ctx.manager.unregister(id);
            Err(e.into())
        }
    }
}

struct Worker {
    id: SubscriptionId,
    request: SubscriptionRequest,
    filter: FactFilter,
    versions: RequestedVersions,
    starting_after: Option<Sequence>,
    ctx: EngineContext,
    cancelled: Arc<AtomicBool>,
    skipped: Arc<AtomicU64>,
}

impl Worker {
    fn run(self, feed: Option<FeedReceiver>, mut observer: Box<dyn FactObserver>, closed: Arc<AtomicBool>) {
        let outcome = self.execute(feed, observer.as_mut());
        self.ctx.manager.unregister(self.id);

        match outcome {
            Ok(()) => debug!(subscription = self.id.0, "Subscription finished"),
            Err(e) if self.is_cancelled() => {
                debug!(subscription = self.id.0, error = %e, "Error after cancellation ignored")
            }
            Err(e) => {
                warn!(subscription = self.id.0, error = %e, "Subscription failed");
                observer.on_error(e);
            }
        }
        closed.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn execute(&self, feed: Option<FeedReceiver>, observer: &mut dyn FactObserver) -> Result<()> {
        observer.on_catchup();

        let mut last = self.starting_after.unwrap_or_default();
        let mut delivered = 0usize;
        let mut saw_mark = false;
        let entries = self
            .ctx
            .log
            .facts_after(self.request.starting_after(), &self.filter.log_filter())?;
        for entry in entries {
            if self.is_cancelled() {
                return Ok(());
            }
            let entry = entry?;
            last = entry.sequence;
            if self.deliver(&entry, observer)? {
                delivered += 1;
                saw_mark |= entry.fact.is_mark();
            }
        }

        if self.request.is_ephemeral() && self.request.marks() && !saw_mark {
            observer.on_next(Arc::new(Fact::mark()));
        }
        debug!(subscription = self.id.0, delivered, last = %last, "Catchup finished");

        match feed {
            Some(feed) => self.follow(feed, last, observer),
            None => {
                observer.on_complete();
                Ok(())
            }
        }
    }

    fn follow(&self, feed: FeedReceiver, mut last: Sequence, observer: &mut dyn FactObserver) -> Result<()> {
        let delay = self.request.max_batch_delay_duration();

        loop {
            let mut batch = match feed.batches.recv() {
                Ok(batch) => batch,
                Err(_) => return self.feed_closed(&feed),
            };

            let mut disconnected = false;
            if !delay.is_zero() {
                let deadline = Instant::now() + delay;
                loop {
                    match feed.batches.recv_deadline(deadline) {
                        Ok(more) => batch.extend(more),
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => {
                            disconnected = true;
                            break;
                        }
                    }
                }
            }

            for entry in batch {
                if self.is_cancelled() {
                    return Ok(());
                }
                // Already delivered during catchup.
                if entry.sequence <= last {
                    continue;
                }
                last = entry.sequence;
                self.deliver(&entry, observer)?;
            }

            if disconnected {
                return self.feed_closed(&feed);
            }
        }
    }

    fn feed_closed(&self, feed: &FeedReceiver) -> Result<()> {
        if self.is_cancelled() {
            Ok(())
        } else if feed.overflowed.load(Ordering::SeqCst) {
            Err(StoreError::SubscriptionDropped)
        } else {
            Err(StoreError::SubscriptionClosed)
        }
    }

    /// Filter, transform and hand one entry to the observer.
    /// Returns whether it was delivered.
    fn deliver(&self, entry: &LogEntry, observer: &mut dyn FactObserver) -> Result<bool> {
        if !self.filter.test(&entry.fact)? {
            return Ok(false);
        }

        let fact = match self.versions.target_for(&entry.fact) {
            None => entry.fact.clone(),
            Some(target) => match self.ctx.transformations.transform_to(&entry.fact, target) {
                Ok(fact) => fact,
                Err(e) if e.is_resolution_error() && !self.ctx.strict_transformations => {
                    warn!(
                        subscription = self.id.0,
                        fact_id = %entry.fact.id,
                        from = entry.fact.version,
                        to = target,
                        error = %e,
                        "Skipping fact that cannot be transformed"
                    );
                    self.skipped.fetch_add(1, Ordering::SeqCst);
                    observer.on_skip(entry.fact.clone(), e);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            },
        };

        observer.on_next(fact);
        Ok(true)
    }
}
