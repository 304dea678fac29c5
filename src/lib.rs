//! Storage and session scoring for a recommender
//!
//! - [`data`]: one storage contract for users, items and feedback over
//!   relational and key-value backends, selected by connection descriptor
//! - [`cache`]: read-only neighbor lists and session scoring over them
//! - [`config`]: TOML configuration that opens both

pub mod cache;
pub mod config;
pub mod data;
pub mod error;
pub mod kv;

// Re-export commonly used types
pub use cache::{NeighborCache, Scored, SessionScorer};
pub use config::StorageConfig;
pub use data::{open_database, Backend, Database};
pub use error::{Result, StorageError};
