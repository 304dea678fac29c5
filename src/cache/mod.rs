//! Neighbor cache
//!
//! Read-only view over ranked lists an offline job writes into a key-value
//! store under `<namespace>/<subject>`. A subject with nothing cached reads as
//! an empty list.

pub mod scorer;

pub use scorer::{rank, NeighborSource, Scored, SessionScorer};

use std::sync::Arc;

use tracing::debug;

use crate::config::CacheNamespaces;
use crate::data::Feedback;
use crate::error::{require_id, Result};
use crate::kv::KvStore;

/// Ranked lists for items, users and offline recommendations
#[derive(Clone)]
pub struct NeighborCache {
    store: Arc<dyn KvStore>,
    namespaces: CacheNamespaces,
}

impl std::fmt::Debug for NeighborCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeighborCache")
            .field("store", &self.store.name())
            .field("namespaces", &self.namespaces)
            .finish()
    }
}

impl NeighborCache {
    pub fn new(store: Arc<dyn KvStore>, namespaces: CacheNamespaces) -> Self {
        Self { store, namespaces }
    }

    /// Top `n` similar items of an item
    pub fn get_neighbors(&self, item_id: &str, n: usize) -> Result<Vec<Scored>> {
        require_id("item", item_id)?;
        self.read(&self.namespaces.item_neighbors, item_id, Some(n))
    }

    /// Top `n` similar users of a user
    pub fn get_user_neighbors(&self, user_id: &str, n: usize) -> Result<Vec<Scored>> {
        require_id("user", user_id)?;
        self.read(&self.namespaces.user_neighbors, user_id, Some(n))
    }

    /// Top `n` offline recommendations of a user
    pub fn get_recommend(&self, user_id: &str, n: usize) -> Result<Vec<Scored>> {
        require_id("user", user_id)?;
        self.read(&self.namespaces.offline_recommend, user_id, Some(n))
    }

    /// Rank candidates for a session ordered oldest first
    pub fn session_recommend(&self, session: &[Feedback], n: usize) -> Result<Vec<Scored>> {
        let ranked = SessionScorer::new(self).recommend(session, n)?;
        debug!(events = session.len(), results = ranked.len(), "scored session");
        Ok(ranked)
    }

    fn read(&self, namespace: &str, subject: &str, n: Option<usize>) -> Result<Vec<Scored>> {
        if n == Some(0) {
            return Ok(Vec::new());
        }
        let key = format!("{namespace}/{subject}");
        let Some(n) = n else {
            let mut scored = to_scored(self.store.top(&key, 0, None)?);
            rank(&mut scored);
            return Ok(scored);
        };

        // Stores order equal scores differently, so read past position n
        // until the score at the cutoff stops repeating.
        let mut entries = self.store.top(&key, 0, Some(n - 1))?;
        while entries.len() >= n {
            let boundary = entries[n - 1].1;
            if entries.last().map(|(_, s)| *s) != Some(boundary) {
                break;
            }
            let begin = entries.len();
            let more = self.store.top(&key, begin, Some(begin + n - 1))?;
            let exhausted = more.len() < n;
            entries.extend(more);
            if exhausted {
                break;
            }
        }
        let mut scored = to_scored(entries);
        rank(&mut scored);
        scored.truncate(n);
        Ok(scored)
    }
}

fn to_scored(entries: Vec<(String, f64)>) -> Vec<Scored> {
    entries
        .into_iter()
        .map(|(id, score)| Scored { id, score })
        .collect()
}

impl NeighborSource for NeighborCache {
    fn neighbors(&self, item_id: &str) -> Result<Vec<Scored>> {
        require_id("item", item_id)?;
        self.read(&self.namespaces.item_neighbors, item_id, None)
    }
}
