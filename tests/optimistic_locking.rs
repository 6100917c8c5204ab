//! Conditional publishing against state tokens.

use factstore::{
    Fact, FactStore, FileFactLog, FileLogConfig, NopSchemaRegistry, StoreConfig, StoreError,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn touch(ns: &str, aggregates: &[Uuid]) -> Fact {
    aggregates
        .iter()
        .fold(Fact::builder(ns), |b, id| b.aggregate_id(*id))
        .build(&json!({}))
        .unwrap()
}

#[test]
fn test_unconditional_publish_always_succeeds() {
    let store = FactStore::in_memory();
    assert!(store.publish_if_unchanged(vec![touch("ns", &[Uuid::new_v4()])], None).unwrap());
}

#[test]
fn test_token_for_untouched_aggregates() {
    let store = FactStore::in_memory();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let token = store.state_for(&[a, b], Some("ns")).unwrap();

    assert!(store.publish_if_unchanged(vec![touch("ns", &[a])], Some(&token)).unwrap());
    // Single use.
    assert!(!store.publish_if_unchanged(vec![touch("ns", &[a])], Some(&token)).unwrap());
}

#[test]
fn test_any_touched_aggregate_rejects() {
    let store = FactStore::in_memory();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    store.publish(vec![touch("ns", &[a])]).unwrap();
    let token = store.state_for(&[a, b], Some("ns")).unwrap();

    store.publish(vec![touch("ns", &[b])]).unwrap();
    assert!(!store.publish_if_unchanged(vec![touch("ns", &[a])], Some(&token)).unwrap());

    // Re-read and retry.
    let fresh = store.state_for(&[a, b], Some("ns")).unwrap();
    assert!(store.publish_if_unchanged(vec![touch("ns", &[a])], Some(&fresh)).unwrap());
}

#[test]
fn test_global_token_sees_every_namespace() {
    let store = FactStore::in_memory();
    let agg = Uuid::new_v4();
    let token = store.state_for(&[agg], None).unwrap();

    store.publish(vec![touch("elsewhere", &[agg])]).unwrap();
    assert!(!store.publish_if_unchanged(vec![touch("ns", &[agg])], Some(&token)).unwrap());
}

#[test]
fn test_expired_token_rejects() {
    let store = FactStore::new(
        Arc::new(factstore::MemFactLog::new()),
        Arc::new(NopSchemaRegistry::new()),
        StoreConfig {
            token_ttl: Duration::from_millis(10),
            ..Default::default()
        },
    );
    let token = store.state_for(&[Uuid::new_v4()], None).unwrap();
    thread::sleep(Duration::from_millis(50));

    assert!(!store.publish_if_unchanged(vec![], Some(&token)).unwrap());
}

#[test]
fn test_sequential_competitors_first_wins() {
    let store = FactStore::in_memory();
    let agg = Uuid::new_v4();
    let tokens: Vec<_> = (0..4)
        .map(|_| store.state_for(&[agg], Some("ns")).unwrap())
        .collect();

    let wins: Vec<bool> = tokens
        .iter()
        .map(|t| store.publish_if_unchanged(vec![touch("ns", &[agg])], Some(t)).unwrap())
        .collect();
    assert_eq!(wins, vec![true, false, false, false]);
}

#[test]
fn test_concurrent_competitors_publish_only_on_success() {
    let store = Arc::new(FactStore::in_memory());
    let agg = Uuid::new_v4();
    let wins = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let wins = wins.clone();
            // Every publisher reads the same initial state.
            let token = store.state_for(&[agg], Some("ns")).unwrap();
            thread::spawn(move || {
                if store.publish_if_unchanged(vec![touch("ns", &[agg])], Some(&token)).unwrap() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let wins = wins.load(Ordering::SeqCst);
    assert!(wins >= 1);
    assert_eq!(store.log().head().map(|s| s.0 as usize), Some(wins));
}

#[test]
fn test_disjoint_aggregates_do_not_conflict() {
    let store = Arc::new(FactStore::in_memory());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                let agg = Uuid::new_v4();
                for _ in 0..20 {
                    let token = store.state_for(&[agg], Some("ns")).unwrap();
                    assert!(store
                        .publish_if_unchanged(vec![touch("ns", &[agg])], Some(&token))
                        .unwrap());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_locked_counter_under_contention() {
    let store = Arc::new(FactStore::in_memory());
    let counter = Uuid::new_v4();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    let published = store
                        .lock("counter")
                        .on(counter)
                        .optimistic()
                        .retry(1_000)
                        .attempt(|| Ok(Some(vec![touch("counter", &[counter])])))
                        .unwrap();
                    assert!(published);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.log().head().map(|s| s.0), Some(40));
}

#[test]
fn test_lock_with_zero_retries() {
    let store = FactStore::in_memory();
    let agg = Uuid::new_v4();

    let result = store.lock("ns").on(agg).optimistic().retry(0).attempt(|| {
        store.publish(vec![touch("ns", &[agg])])?;
        Ok(Some(vec![touch("ns", &[agg])]))
    });
    assert!(matches!(result, Err(StoreError::OptimisticRetriesExceeded(1))));
}

#[test]
fn test_conditional_publish_on_file_log() {
    let dir = TempDir::new().unwrap();
    let config = FileLogConfig {
        path: dir.path().join("facts"),
        ..Default::default()
    };
    let agg = Uuid::new_v4();

    {
        let log = Arc::new(FileFactLog::open(config.clone()).unwrap());
        let store = FactStore::new(log, Arc::new(NopSchemaRegistry::new()), StoreConfig::default());
        store.publish(vec![touch("ns", &[agg])]).unwrap();
    }

    // State survives a reopen.
    let log = Arc::new(FileFactLog::open(config).unwrap());
    let store = FactStore::new(log, Arc::new(NopSchemaRegistry::new()), StoreConfig::default());
    let before = store.current_state(&[agg], Some("ns")).unwrap();
    assert!(before[&agg].is_some());

    let token = store.state_for(&[agg], Some("ns")).unwrap();
    assert!(store.publish_if_unchanged(vec![touch("ns", &[agg])], Some(&token)).unwrap());
    assert_ne!(store.current_state(&[agg], Some("ns")).unwrap(), before);
}
