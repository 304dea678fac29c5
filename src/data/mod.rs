//! Data store abstraction
//!
//! One uniform contract ([`Database`]) for users, items and feedback over
//! physically different backends. The router turns a connection descriptor
//! into a [`Backend`]; everything downstream passes that handle around.
//!
//! # Example
//! ```no_run
//! use recstore::data::{open_database, Database, User};
//!
//! let db = open_database("sqlite:///tmp/recstore.db", "", &Default::default())?;
//! db.init()?;
//! db.batch_insert_users(&[User::new("100")])?;
//! assert_eq!(db.get_user("100")?.user_id, "100");
//! # Ok::<(), recstore::StorageError>(())
//! ```

pub mod cursor;
pub mod kv;
pub mod router;
pub mod sql;
pub mod stream;
pub mod types;

pub use kv::KeyValueDatabase;
pub use router::{open_database, Backend, Descriptor, SqlDialect};
pub use sql::SqlDatabase;
pub use stream::BatchStream;
pub use types::{
    sort_feedback, Feedback, FeedbackFilter, FeedbackKey, Item, ItemFilter, ItemPatch, User,
    UserPatch,
};

use crate::error::Result;

/// Flags for [`Database::batch_insert_feedback`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackInsert {
    /// Create missing users instead of skipping their feedback
    pub insert_user: bool,
    /// Create missing items instead of skipping their feedback
    pub insert_item: bool,
    /// Replace timestamp and comment of existing keys; without it an existing
    /// key rejects the whole batch with `Conflict`
    pub overwrite: bool,
}

impl FeedbackInsert {
    /// Create missing users and items, replace existing feedback
    pub fn upsert() -> Self {
        Self {
            insert_user: true,
            insert_item: true,
            overwrite: true,
        }
    }
}

/// Storage contract shared by every backend family
///
/// Semantics are identical across implementations:
/// - batch inserts are all-or-nothing for readers of the same handle
/// - `get_*` on an absent id fails with `NotFound`, `delete_*` is a no-op
/// - patches only touch fields that are `Some`
/// - listings page forward in key order; the empty cursor starts and ends a scan
pub trait Database: Send + Sync {
    /// Backend name for debugging/logging
    fn backend_name(&self) -> &'static str;

    /// Create tables/indexes if missing
    fn init(&self) -> Result<()>;

    /// Release the connection; later calls fail with `BackendUnavailable`
    fn close(&self) -> Result<()>;

    /// Backend-specific compaction; no-op where there is no such concept
    fn optimize(&self) -> Result<()>;

    /// Delete all users, items and feedback
    fn purge(&self) -> Result<()>;

    fn batch_insert_users(&self, users: &[User]) -> Result<()>;

    fn get_user(&self, user_id: &str) -> Result<User>;

    /// Feedback of the user is kept
    fn delete_user(&self, user_id: &str) -> Result<()>;

    fn modify_user(&self, user_id: &str, patch: &UserPatch) -> Result<()>;

    fn get_users(&self, cursor: &str, n: usize) -> Result<(String, Vec<User>)>;

    fn batch_insert_items(&self, items: &[Item]) -> Result<()>;

    /// Existing items among `item_ids`, ordered by id
    fn batch_get_items(&self, item_ids: &[String]) -> Result<Vec<Item>>;

    fn get_item(&self, item_id: &str) -> Result<Item>;

    fn delete_item(&self, item_id: &str) -> Result<()>;

    fn modify_item(&self, item_id: &str, patch: &ItemPatch) -> Result<()>;

    fn get_items(&self, cursor: &str, n: usize, filter: &ItemFilter)
        -> Result<(String, Vec<Item>)>;

    fn batch_insert_feedback(&self, feedback: &[Feedback], flags: FeedbackInsert) -> Result<()>;

    /// Feedback ordered by key, excluding future-dated rows
    fn get_feedback(
        &self,
        cursor: &str,
        n: usize,
        filter: &FeedbackFilter,
    ) -> Result<(String, Vec<Feedback>)>;

    /// Latest first; empty `feedback_types` means all types
    fn get_user_feedback(
        &self,
        user_id: &str,
        with_future: bool,
        feedback_types: &[String],
    ) -> Result<Vec<Feedback>>;

    /// Latest first, excluding future-dated rows
    fn get_item_feedback(&self, item_id: &str, feedback_types: &[String])
        -> Result<Vec<Feedback>>;

    fn get_user_item_feedback(
        &self,
        user_id: &str,
        item_id: &str,
        feedback_types: &[String],
    ) -> Result<Vec<Feedback>>;

    /// Returns the number of deleted rows
    fn delete_user_item_feedback(
        &self,
        user_id: &str,
        item_id: &str,
        feedback_types: &[String],
    ) -> Result<usize>;

    fn get_user_stream(&self, batch_size: usize) -> Result<BatchStream<User>>;

    fn get_item_stream(&self, batch_size: usize, filter: ItemFilter) -> Result<BatchStream<Item>>;

    fn get_feedback_stream(
        &self,
        batch_size: usize,
        filter: FeedbackFilter,
    ) -> Result<BatchStream<Feedback>>;
}
