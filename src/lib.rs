//! # Fact Store
//!
//! An append-only store of facts with optimistic concurrency, schema-versioned
//! fact transformation and catchup/follow subscriptions.
//!
//! ## Core Concepts
//!
//! - **Facts**: Immutable JSON header + payload pairs, grouped by namespace
//!   and type and tagged with the aggregates they concern
//! - **State tokens**: Snapshots of aggregate state for conditional publishing
//! - **Transformations**: Scripted steps between schema versions of a fact type
//! - **Subscriptions**: Replay of matching facts, optionally followed by live ones
//!
//! ## Example
//!
//! ```ignore
//! use factstore::{ChannelObserver, Fact, FactSpec, FactStore, SubscriptionRequest};
//!
//! let store = FactStore::in_memory();
//!
//! // Publish a fact
//! store.publish(vec![Fact::builder("users")
//!     .fact_type("UserCreated")
//!     .version(1)
//!     .aggregate_id(user_id)
//!     .build(&json!({ "name": "Ada" }))?])?;
//!
//! // Publish only if nobody touched the user in between
//! let token = store.state_for(&[user_id], Some("users"))?;
//! let published = store.publish_if_unchanged(facts, Some(&token))?;
//!
//! // Replay everything about users, then keep following
//! let (observer, events) = ChannelObserver::new();
//! let subscription = store.subscribe(SubscriptionRequest::follow(FactSpec::ns("users")), observer)?;
//! ```

pub mod error;
pub mod lock;
pub mod log;
pub mod registry;
pub mod script;
pub mod store;
pub mod subscriptions;
pub mod tokens;
pub mod transformation;
pub mod types;

// Re-exports
pub use error::{Result, StoreError};
pub use lock::{LockedOperationBuilder, OptimisticLock};
pub use log::{FactLog, FileFactLog, FileLogConfig, LogFilter, MemFactLog, PublishListener};
pub use registry::{
    IndexedSchemaRegistry, NopSchemaRegistry, RegistryConfig, RegistryRefresher, RegistrySnapshot,
    SchemaKey, SchemaRegistry,
};
pub use script::{ScriptEngine, ScriptError};
pub use store::{FactStore, StoreConfig};
pub use subscriptions::{
    ChannelObserver, EventReceiver, FactObserver, FactSpec, Subscription, SubscriptionEvent,
    SubscriptionId, SubscriptionRequest,
};
pub use tokens::{AggregateState, InMemTokenStore, StateToken, TokenStore};
pub use transformation::{
    InMemTransformationCache, Transformation, TransformationCache, TransformationChain,
    TransformationKey, TransformationService,
};
pub use types::*;
