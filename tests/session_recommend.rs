//! Neighbor cache reads and session scoring through the public API

use std::sync::Arc;

use approx::assert_relative_eq;
use chrono::Utc;
use recstore::config::CacheNamespaces;
use recstore::data::{Feedback, FeedbackKey};
use recstore::kv::MemoryStore;
use recstore::{NeighborCache, Scored, StorageConfig};

fn chain_cache() -> NeighborCache {
    let store = MemoryStore::new();
    store.put_sorted("item_neighbors/1", [("2", 100000.0), ("9", 1.0)]);
    store.put_sorted("item_neighbors/2", [("3", 100000.0), ("8", 1.0), ("9", 1.0)]);
    store.put_sorted(
        "item_neighbors/3",
        [("4", 100000.0), ("7", 1.0), ("8", 1.0), ("9", 1.0)],
    );
    store.put_sorted(
        "item_neighbors/4",
        [("1", 100000.0), ("6", 1.0), ("7", 1.0), ("8", 1.0), ("9", 1.0)],
    );
    NeighborCache::new(Arc::new(store), CacheNamespaces::default())
}

fn session(items: &[&str]) -> Vec<Feedback> {
    let now = Utc::now();
    items
        .iter()
        .map(|item| Feedback::new(FeedbackKey::new("read", "u", *item), now))
        .collect()
}

#[test]
fn test_session_recommend_example() {
    let cache = chain_cache();
    let ranked = cache.session_recommend(&session(&["1", "2", "3", "4"]), 3).unwrap();

    let ids: Vec<_> = ranked.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["9", "8", "7"]);
    let scores: Vec<f64> = ranked.iter().map(|s| s.score).collect();
    for (got, want) in scores.iter().zip([4.0, 3.0, 2.0]) {
        assert_relative_eq!(*got, want);
    }
}

#[test]
fn test_session_never_recommends_its_own_items() {
    let cache = chain_cache();
    for items in [&["1"][..], &["1", "2"], &["4", "3"], &["2", "2", "1"]] {
        let ranked = cache.session_recommend(&session(items), 100).unwrap();
        for scored in &ranked {
            assert!(
                !items.contains(&scored.id.as_str()),
                "{} recommended for session {items:?}",
                scored.id
            );
        }
    }
}

#[test]
fn test_session_recommend_edge_cases() {
    let cache = chain_cache();
    assert!(cache.session_recommend(&[], 3).unwrap().is_empty());
    assert!(cache.session_recommend(&session(&["1"]), 0).unwrap().is_empty());
    assert!(cache.session_recommend(&session(&["cold"]), 3).unwrap().is_empty());
}

#[test]
fn test_get_neighbors_example() {
    let store = MemoryStore::new();
    store.put_sorted("item_neighbors/100", [("1", 1.0), ("2", 2.0), ("3", 3.0)]);
    let cache = NeighborCache::new(Arc::new(store), CacheNamespaces::default());

    assert_eq!(
        cache.get_neighbors("100", 3).unwrap(),
        vec![
            Scored::new("3", 3.0),
            Scored::new("2", 2.0),
            Scored::new("1", 1.0),
        ]
    );
}

#[test]
fn test_cache_opened_from_config() {
    let config = StorageConfig::default();
    let cache = config.open_cache().unwrap();
    assert!(cache.get_recommend("nobody", 10).unwrap().is_empty());

    let mut bad = StorageConfig::default();
    bad.database.cache_store = "sqlite://cache.db".to_string();
    assert!(bad.open_cache().is_err());
}
