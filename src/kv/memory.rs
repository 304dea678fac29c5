//! In-process key-value store
//!
//! Everything sits behind one lock, so an `apply` is visible all at once.
//! Clones share state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{KvOp, KvStore};
use crate::error::{Result, StorageError};

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, String>,
    /// member -> score, ordered by member
    sorted: HashMap<String, BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    closed: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a ranked list, as the offline job would
    pub fn put_sorted<I, S>(&self, key: &str, entries: I)
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut state = self.state.write();
        let set = state.sorted.entry(key.to_string()).or_default();
        for (member, score) in entries {
            set.insert(member.into(), score);
        }
    }

    pub fn num_keys(&self) -> usize {
        let state = self.state.read();
        state.strings.len() + state.sorted.len()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::BackendUnavailable("store is closed".into()));
        }
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn ping(&self) -> Result<()> {
        self.check_open()
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_open()?;
        Ok(self.state.read().strings.get(key).cloned())
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.check_open()?;
        let state = self.state.read();
        Ok(keys.iter().map(|k| state.strings.get(k).cloned()).collect())
    }

    fn range_after(&self, key: &str, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        self.check_open()?;
        let state = self.state.read();
        let Some(set) = state.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let members = set.keys().filter(|m| match after {
            Some(after) => m.as_str() > after,
            None => true,
        });
        Ok(members.take(limit).cloned().collect())
    }

    fn members(&self, key: &str) -> Result<Vec<String>> {
        self.check_open()?;
        let state = self.state.read();
        Ok(state
            .sorted
            .get(key)
            .map(|set| set.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn top(&self, key: &str, begin: usize, end: Option<usize>) -> Result<Vec<(String, f64)>> {
        self.check_open()?;
        let state = self.state.read();
        let Some(set) = state.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(String, f64)> =
            set.iter().map(|(m, s)| (m.clone(), *s)).collect();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let end = end.map_or(entries.len(), |e| (e + 1).min(entries.len()));
        if begin >= end {
            return Ok(Vec::new());
        }
        Ok(entries[begin..end].to_vec())
    }

    fn apply(&self, ops: Vec<KvOp>) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write();
        for op in ops {
            match op {
                KvOp::Set { key, value } => {
                    state.strings.insert(key, value);
                }
                KvOp::Del { key } => {
                    state.strings.remove(&key);
                    state.sorted.remove(&key);
                }
                KvOp::ZAdd { key, member, score } => {
                    state.sorted.entry(key).or_default().insert(member, score);
                }
                KvOp::ZRem { key, member } => {
                    if let Some(set) = state.sorted.get_mut(&key) {
                        set.remove(&member);
                        if set.is_empty() {
                            state.sorted.remove(&key);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write();
        state.strings.clear();
        state.sorted.clear();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
