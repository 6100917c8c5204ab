use crate::error::StoreError;
use crate::types::Fact;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Receives what a subscription delivers.
///
/// Called from the subscription's worker thread. After `on_complete` or
/// `on_error` nothing else is called.
pub trait FactObserver: Send + 'static {
    fn on_next(&mut self, fact: Arc<Fact>);

    /// Catchup has started.
    fn on_catchup(&mut self) {}

    /// Catchup-only subscription delivered everything.
    fn on_complete(&mut self) {}

    /// A matching fact was left out because it could not be brought to the
    /// requested version. Only called when transformations are lenient.
    fn on_skip(&mut self, _fact: Arc<Fact>, _error: StoreError) {}

    fn on_error(&mut self, error: StoreError) {
        error!(error = %error, "Subscription failed");
    }
}

/// Signal forwarded by a [`ChannelObserver`].
#[derive(Debug)]
pub enum SubscriptionEvent {
    Fact(Arc<Fact>),
    Catchup,
    Complete,
    Skipped { fact: Arc<Fact>, error: StoreError },
    Error(StoreError),
}

impl SubscriptionEvent {
    pub fn into_fact(self) -> Option<Arc<Fact>> {
        match self {
            SubscriptionEvent::Fact(fact) => Some(fact),
            _ => None,
        }
    }
}

/// Forwards observer calls into a channel.
pub struct ChannelObserver {
    sender: Sender<SubscriptionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, EventReceiver) {
        let (sender, receiver) = unbounded();
        (Self { sender }, EventReceiver { receiver })
    }

    fn send(&self, event: SubscriptionEvent) {
        // The receiving side may be gone; the subscription ends on its own.
        let _ = self.sender.send(event);
    }
}

impl FactObserver for ChannelObserver {
    fn on_next(&mut self, fact: Arc<Fact>) {
        self.send(SubscriptionEvent::Fact(fact));
    }

    fn on_catchup(&mut self) {
        self.send(SubscriptionEvent::Catchup);
    }

    fn on_complete(&mut self) {
        self.send(SubscriptionEvent::Complete);
    }

    fn on_skip(&mut self, fact: Arc<Fact>, error: StoreError) {
        self.send(SubscriptionEvent::Skipped { fact, error });
    }

    fn on_error(&mut self, error: StoreError) {
        self.send(SubscriptionEvent::Error(error));
    }
}

/// Receiving end of a [`ChannelObserver`].
pub struct EventReceiver {
    receiver: Receiver<SubscriptionEvent>,
}

impl EventReceiver {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<SubscriptionEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<SubscriptionEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<SubscriptionEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything received until `timeout` passes without a new event.
    pub fn drain(&self, timeout: Duration) -> Vec<SubscriptionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.recv_timeout(timeout) {
            events.push(event);
        }
        events
    }
}
