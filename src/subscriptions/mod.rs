//! Subscriptions: catchup replay followed by live delivery.
//!
//! A subscription first replays every matching fact already in the log
//! (catchup). A catchup-only subscription then completes; a continuous one
//! keeps receiving newly published facts (follow) until cancelled.
//!
//! Subscriptions support:
//! - Filtering by namespace, type, meta, aggregate ids and script predicates
//! - Delivery in a requested schema version
//! - Bounded live buffers with slow-subscriber dropping
//!
//! # Example
//!
//! ```ignore
//! let (observer, events) = ChannelObserver::new();
//! let request = SubscriptionRequest::follow(FactSpec::ns("users").fact_type("UserCreated").version(2));
//! let subscription = store.subscribe(request, observer)?;
//!
//! loop {
//!     match events.recv() {
//!         Ok(SubscriptionEvent::Fact(fact)) => println!("Got fact: {}", fact.id),
//!         Ok(SubscriptionEvent::Catchup) => println!("Replaying history"),
//!         Ok(SubscriptionEvent::Error(e)) => break,
//!         _ => {}
//!     }
//! }
//! ```

mod engine;
mod filter;
mod manager;
mod observer;
mod types;
mod versions;

pub(crate) use engine::{start, EngineContext};
pub use engine::Subscription;
pub use filter::FactFilter;
pub use manager::SubscriptionManager;
pub use observer::{ChannelObserver, EventReceiver, FactObserver, SubscriptionEvent};
pub use types::{FactSpec, SubscriptionId, SubscriptionRequest};
pub use versions::RequestedVersions;
