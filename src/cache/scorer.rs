//! Session scoring over neighbor graphs
//!
//! Score for candidate c = Σ similarity(i, c) over every session event i,
//! skipping candidates the session already touched.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::Feedback;
use crate::error::Result;

/// A candidate id with its score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scored {
    pub id: String,
    pub score: f64,
}

impl Scored {
    pub fn new(id: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            score,
        }
    }
}

/// Sort by score descending, ties by id ascending
pub fn rank(entries: &mut [Scored]) {
    entries.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
}

/// Source of neighbor lists, one per subject id
pub trait NeighborSource: Sync {
    /// Full neighbor list; empty when nothing is cached
    fn neighbors(&self, item_id: &str) -> Result<Vec<Scored>>;
}

/// Ranks candidates for the current session
pub struct SessionScorer<'a, S: NeighborSource> {
    source: &'a S,
}

impl<'a, S: NeighborSource> SessionScorer<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Up to `n` candidates for a session ordered oldest first
    pub fn recommend(&self, session: &[Feedback], n: usize) -> Result<Vec<Scored>> {
        let items: Vec<&str> = session.iter().map(|f| f.item_id()).collect();
        self.recommend_items(&items, n)
    }

    /// Same as [`recommend`](Self::recommend) over bare item ids
    pub fn recommend_items(&self, items: &[&str], n: usize) -> Result<Vec<Scored>> {
        if n == 0 || items.is_empty() {
            return Ok(Vec::new());
        }
        let seen: HashSet<&str> = items.iter().copied().collect();

        // Fetches are independent; collect keeps event order
        let lists: Vec<Vec<Scored>> = items
            .par_iter()
            .map(|item| self.source.neighbors(item))
            .collect::<Result<_>>()?;

        // Summed in event order so the floating point result is reproducible
        let mut scores: HashMap<String, f64> = HashMap::new();
        for neighbor in lists.into_iter().flatten() {
            if seen.contains(neighbor.id.as_str()) {
                continue;
            }
            *scores.entry(neighbor.id).or_insert(0.0) += neighbor.score;
        }

        let mut ranked: Vec<Scored> = scores
            .into_iter()
            .map(|(id, score)| Scored { id, score })
            .collect();
        rank(&mut ranked);
        ranked.truncate(n);
        Ok(ranked)
    }
}
