//! Key-value client interface
//!
//! The subset of a sorted-set/string store used by the key-value data adapter
//! and by the neighbor cache. Drivers are black boxes behind [`KvStore`]:
//! Redis (single node or cluster) and an in-process map.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::Result;

/// A write applied as part of one [`KvStore::apply`] call
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    Set { key: String, value: String },
    Del { key: String },
    ZAdd { key: String, member: String, score: f64 },
    ZRem { key: String, member: String },
}

impl KvOp {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvOp::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        KvOp::Del { key: key.into() }
    }

    /// Add to a lexicographic index (score 0)
    pub fn index(key: impl Into<String>, member: impl Into<String>) -> Self {
        KvOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score: 0.0,
        }
    }

    pub fn unindex(key: impl Into<String>, member: impl Into<String>) -> Self {
        KvOp::ZRem {
            key: key.into(),
            member: member.into(),
        }
    }
}

/// Key-value store with strings and sorted sets
pub trait KvStore: Send + Sync {
    /// Store name for debugging/logging
    fn name(&self) -> &'static str;

    fn ping(&self) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<String>>;

    /// One slot per key, in order
    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Members of a score-0 sorted set strictly after `after`, in
    /// lexicographic order
    fn range_after(&self, key: &str, after: Option<&str>, limit: usize) -> Result<Vec<String>>;

    /// All members of a sorted set
    fn members(&self, key: &str) -> Result<Vec<String>>;

    /// Entries of a sorted set by score descending, positions `begin..=end`
    /// (`None` means to the last entry)
    fn top(&self, key: &str, begin: usize, end: Option<usize>) -> Result<Vec<(String, f64)>>;

    /// Apply writes together
    fn apply(&self, ops: Vec<KvOp>) -> Result<()>;

    /// Delete every key
    fn flush(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}
