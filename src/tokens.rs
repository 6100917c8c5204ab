//! State tokens for optimistic concurrency.
//!
//! A token names a point-in-time snapshot of "last fact per aggregate".
//! Tokens live in process memory only and expire after a TTL; losing one
//! just makes the conditional publish that needed it fail.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Last fact id per aggregate id; `None` if no fact ever touched it.
pub type AggregateState = BTreeMap<Uuid, Option<Uuid>>;

/// True if `current` describes exactly the aggregates of `snapshot`, each
/// with the same last fact (or the same absence of one).
pub fn is_state_unchanged(current: &AggregateState, snapshot: &AggregateState) -> bool {
    current.len() == snapshot.len()
        && snapshot
            .iter()
            .all(|(aggregate_id, last)| current.get(aggregate_id) == Some(last))
}

/// Opaque handle to a stored aggregate-state snapshot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateToken(Uuid);

impl StateToken {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateToken({})", self.0)
    }
}

impl fmt::Display for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a token refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenState {
    pub ns: Option<String>,
    pub state: AggregateState,
}

/// Storage for state tokens.
pub trait TokenStore: Send + Sync {
    /// Store a snapshot under a fresh token.
    fn create(&self, state: AggregateState, ns: Option<String>) -> StateToken;

    /// Look up a live token.
    fn get(&self, token: &StateToken) -> Option<TokenState>;

    /// Remove a live token and return what it referred to.
    ///
    /// At most one caller ever receives `Some` for a given token.
    fn take(&self, token: &StateToken) -> Option<TokenState>;

    /// Put back a token previously removed by [`TokenStore::take`], for a
    /// publish that failed before anything was appended.
    fn restore(&self, token: &StateToken, state: TokenState);

    /// Forget a token. Unknown tokens are ignored.
    fn invalidate(&self, token: &StateToken);

    /// Number of tokens currently held (including not yet evicted expired ones).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct TokenEntry {
    state: TokenState,
    created: Instant,
}

/// In-memory token store with a TTL and a capacity bound.
///
/// Lookups never refresh recency, so LRU order is creation order and
/// expired tokens can be purged from the tail.
pub struct InMemTokenStore {
    ttl: Duration,
    tokens: Mutex<LruCache<StateToken, TokenEntry>>,
}

impl InMemTokenStore {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            tokens: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn expired(&self, entry: &TokenEntry, now: Instant) -> bool {
        now.duration_since(entry.created) >= self.ttl
    }

    fn purge_expired(&self, tokens: &mut LruCache<StateToken, TokenEntry>, now: Instant) {
        while let Some((_, entry)) = tokens.peek_lru() {
            if !self.expired(entry, now) {
                break;
            }
            tokens.pop_lru();
        }
    }
}

impl Default for InMemTokenStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 100_000)
    }
}

impl TokenStore for InMemTokenStore {
    fn create(&self, state: AggregateState, ns: Option<String>) -> StateToken {
        let token = StateToken(Uuid::new_v4());
        let now = Instant::now();
        let mut tokens = self.tokens.lock();
        self.purge_expired(&mut tokens, now);
        tokens.put(
            token,
            TokenEntry {
                state: TokenState { ns, state },
                created: now,
            },
        );
        token
    }

    fn get(&self, token: &StateToken) -> Option<TokenState> {
        let now = Instant::now();
        let mut tokens = self.tokens.lock();
        let expired = self.expired(tokens.peek(token)?, now);
        if expired {
            tokens.pop(token);
            return None;
        }
        tokens.peek(token).map(|entry| entry.state.clone())
    }

    fn take(&self, token: &StateToken) -> Option<TokenState> {
        let now = Instant::now();
        let entry = self.tokens.lock().pop(token)?;
        if self.expired(&entry, now) {
            None
        } else {
            Some(entry.state)
        }
    }

    fn restore(&self, token: &StateToken, state: TokenState) {
        let mut tokens = self.tokens.lock();
        tokens.put(
            *token,
            TokenEntry {
                state,
                created: Instant::now(),
            },
        );
    }

    fn invalidate(&self, token: &StateToken) {
        self.tokens.lock().pop(token);
    }

    fn len(&self) -> usize {
        self.tokens.lock().len()
    }
}
