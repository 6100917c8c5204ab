//! Main FactStore struct tying all components together.

use crate::error::{Result, StoreError};
use crate::lock::LockedOperationBuilder;
use crate::log::{FactLog, ListenerId, MemFactLog};
use crate::registry::{NopSchemaRegistry, SchemaRegistry};
use crate::script::ScriptEngine;
use crate::subscriptions::{self, EngineContext, FactObserver, Subscription, SubscriptionManager, SubscriptionRequest};
use crate::tokens::{is_state_unchanged, AggregateState, InMemTokenStore, StateToken, TokenStore};
use crate::transformation::{FactTransformer, InMemTransformationCache, TransformationChains, TransformationService};
use crate::types::Fact;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// How long a state token stays usable.
    pub token_ttl: Duration,

    /// Max live state tokens; the oldest are evicted first.
    pub token_capacity: usize,

    /// Transformed facts kept in memory.
    pub transformation_cache_size: usize,

    /// Resolved transformation chains kept in memory.
    pub chain_cache_size: usize,

    /// Compiled scripts kept in memory.
    pub script_cache_size: usize,

    /// Max buffered live batches per subscription before it is dropped.
    pub subscription_buffer_size: usize,

    /// Fail a subscription when a fact cannot be transformed, instead of
    /// skipping the fact.
    pub strict_transformations: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(60),
            token_capacity: 100_000,
            transformation_cache_size: 10_000,
            chain_cache_size: 1_000,
            script_cache_size: 256,
            subscription_buffer_size: 1_000,
            strict_transformations: false,
        }
    }
}

/// The fact store.
///
/// Provides a unified interface for:
/// - Publishing facts, unconditionally or guarded by a state token
/// - Subscribing to historical and live facts
/// - Fetching facts, optionally in another schema version
pub struct FactStore {
    config: StoreConfig,
    log: Arc<dyn FactLog>,
    registry: Arc<dyn SchemaRegistry>,
    tokens: Arc<dyn TokenStore>,
    engine: EngineContext,
    listener: ListenerId,
}

impl FactStore {
    pub fn new(log: Arc<dyn FactLog>, registry: Arc<dyn SchemaRegistry>, config: StoreConfig) -> Self {
        let tokens = Arc::new(InMemTokenStore::new(config.token_ttl, config.token_capacity));
        Self::with_token_store(log, registry, tokens, config)
    }

    pub fn with_token_store(
        log: Arc<dyn FactLog>,
        registry: Arc<dyn SchemaRegistry>,
        tokens: Arc<dyn TokenStore>,
        config: StoreConfig,
    ) -> Self {
        let scripts = Arc::new(ScriptEngine::new(config.script_cache_size));
        let transformations = Arc::new(TransformationService::new(
            TransformationChains::new(registry.clone(), config.chain_cache_size),
            FactTransformer::new(scripts.clone()),
            Arc::new(InMemTransformationCache::new(config.transformation_cache_size)),
        ));

        let manager = Arc::new(SubscriptionManager::new());
        let listener = log.register_listener(manager.clone());

        let engine = EngineContext {
            log: log.clone(),
            manager,
            transformations,
            scripts,
            strict_transformations: config.strict_transformations,
            buffer_size: config.subscription_buffer_size,
        };

        Self {
            config,
            log,
            registry,
            tokens,
            engine,
            listener,
        }
    }

    /// In-memory store without schema validation.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemFactLog::new()),
            Arc::new(NopSchemaRegistry::new()),
            StoreConfig::default(),
        )
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<dyn FactLog> {
        &self.log
    }

    pub fn registry(&self) -> &Arc<dyn SchemaRegistry> {
        &self.registry
    }

    // --- Publishing ---

    /// Validate and append facts.
    ///
    /// One invalid fact rejects the whole batch.
    pub fn publish(&self, facts: Vec<Fact>) -> Result<()> {
        self.check_all(&facts)?;
        self.append(facts)
    }

    /// Publish facts followed by a mark fact; returns the mark's id.
    pub fn publish_with_mark(&self, mut facts: Vec<Fact>) -> Result<Uuid> {
        self.check_all(&facts)?;
        let mark = Fact::mark();
        let mark_id = mark.id;
        facts.push(mark);
        self.append(facts)?;
        Ok(mark_id)
    }

    /// Publish only if the aggregates captured by `token` are unchanged.
    ///
    /// Without a token this is [`FactStore::publish`] and returns true.
    /// An unknown, expired or already used token, or changed state, yields
    /// `Ok(false)`; a changed state leaves the token usable, and so does an
    /// error raised before the facts were appended.
    pub fn publish_if_unchanged(&self, facts: Vec<Fact>, token: Option<&StateToken>) -> Result<bool> {
        let Some(token) = token else {
            self.publish(facts)?;
            return Ok(true);
        };

        let Some(snapshot) = self.tokens.get(token) else {
            debug!(%token, "Unknown or expired state token");
            return Ok(false);
        };

        let aggregate_ids: Vec<Uuid> = snapshot.state.keys().copied().collect();
        let current = self.log.state_for(&aggregate_ids, snapshot.ns.as_deref())?;
        if !is_state_unchanged(&current, &snapshot.state) {
            debug!(%token, "Aggregate state changed since token was issued");
            return Ok(false);
        }

        self.check_all(&facts)?;
        let Some(taken) = self.tokens.take(token) else {
            debug!(%token, "State token consumed concurrently");
            return Ok(false);
        };
        if let Err(e) = self.append(facts) {
            // Nothing was appended, so the token still describes the log.
            self.tokens.restore(token, taken);
            return Err(e);
        }
        Ok(true)
    }

    /// Capture the last fact per aggregate in a fresh token.
    pub fn state_for(&self, aggregate_ids: &[Uuid], ns: Option<&str>) -> Result<StateToken> {
        let state = self.current_state(aggregate_ids, ns)?;
        Ok(self.tokens.create(state, ns.map(String::from)))
    }

    /// The last fact per aggregate, right now.
    pub fn current_state(&self, aggregate_ids: &[Uuid], ns: Option<&str>) -> Result<AggregateState> {
        if aggregate_ids.is_empty() {
            return Err(StoreError::InvalidArgument(
                "state needs at least one aggregate id".into(),
            ));
        }
        self.log.state_for(aggregate_ids, ns)
    }

    /// Release a token. Unknown tokens are ignored.
    pub fn invalidate(&self, token: &StateToken) {
        self.tokens.invalidate(token);
    }

    /// Optimistic read-decide-publish over a set of aggregates.
    pub fn lock(&self, ns: impl Into<String>) -> LockedOperationBuilder<'_> {
        LockedOperationBuilder::new(self, Some(ns.into()))
    }

    /// Like [`FactStore::lock`], across all namespaces.
    pub fn lock_global(&self) -> LockedOperationBuilder<'_> {
        LockedOperationBuilder::new(self, None)
    }

    /// True if the registry accepts `fact`. Marks are always valid.
    pub fn validate(&self, fact: &Fact) -> bool {
        fact.is_mark() || self.registry.validate(fact)
    }

    // --- Reading ---

    pub fn subscribe(&self, request: SubscriptionRequest, observer: impl FactObserver) -> Result<Subscription> {
        subscriptions::start(&self.engine, request, Box::new(observer))
    }

    pub fn fetch_by_id(&self, id: Uuid) -> Result<Option<Arc<Fact>>> {
        Ok(self.log.fetch_by_id(id)?.map(|entry| entry.fact))
    }

    /// Fetch a fact as it looks in `version`. `0` returns it as published.
    pub fn fetch_by_id_and_version(&self, id: Uuid, version: u32) -> Result<Option<Arc<Fact>>> {
        let Some(fact) = self.fetch_by_id(id)? else {
            return Ok(None);
        };
        if version == 0 || fact.version == version {
            return Ok(Some(fact));
        }
        self.engine
            .transformations
            .transform_to(&fact, version)
            .map(Some)
    }

    /// Number of state tokens currently held.
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Number of subscriptions receiving live facts.
    pub fn subscription_count(&self) -> usize {
        self.engine.manager.subscription_count()
    }

    fn check_all(&self, facts: &[Fact]) -> Result<()> {
        facts
            .iter()
            .filter(|f| !f.is_mark())
            .try_for_each(|f| self.registry.check(f))
    }

    fn append(&self, facts: Vec<Fact>) -> Result<()> {
        if facts.is_empty() {
            return Ok(());
        }
        let entries = self.log.append(facts)?;
        debug!(
            count = entries.len(),
            first = %entries[0].sequence,
            "Published facts"
        );
        Ok(())
    }
}

impl Drop for FactStore {
    fn drop(&mut self) {
        self.log.unregister_listener(self.listener);
        self.engine.manager.close_all();
    }
}
