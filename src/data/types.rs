//! Domain types for the data store
//!
//! These types are backend-agnostic - they don't know about SQLite or Redis.
//! Adapters handle serialization/deserialization.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{require_id, Result, StorageError};

/// Meta data about a user
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub subscribe: Vec<String>,
    #[serde(default)]
    pub comment: String,
}

impl User {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Label and subscription sets are stored without duplicates
    pub(crate) fn normalized(mut self) -> Self {
        dedup_in_place(&mut self.labels);
        dedup_in_place(&mut self.subscribe);
        self
    }
}

/// Modification on a user; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub labels: Option<Vec<String>>,
    pub subscribe: Option<Vec<String>>,
    pub comment: Option<String>,
}

impl UserPatch {
    pub fn apply(&self, user: &mut User) {
        if let Some(labels) = &self.labels {
            user.labels = dedup(labels);
        }
        if let Some(subscribe) = &self.subscribe {
            user.subscribe = dedup(subscribe);
        }
        if let Some(comment) = &self.comment {
            user.comment = comment.clone();
        }
    }
}

/// Meta data about an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub categories: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub comment: String,
}

impl Item {
    pub fn new(item_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            item_id: item_id.into(),
            is_hidden: false,
            categories: Vec::new(),
            timestamp,
            labels: Vec::new(),
            comment: String::new(),
        }
    }

    pub(crate) fn normalized(mut self) -> Self {
        dedup_in_place(&mut self.categories);
        dedup_in_place(&mut self.labels);
        self
    }
}

/// Modification on an item; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPatch {
    pub is_hidden: Option<bool>,
    pub categories: Option<Vec<String>>,
    pub timestamp: Option<DateTime<Utc>>,
    pub labels: Option<Vec<String>>,
    pub comment: Option<String>,
}

impl ItemPatch {
    pub fn apply(&self, item: &mut Item) {
        if let Some(is_hidden) = self.is_hidden {
            item.is_hidden = is_hidden;
        }
        if let Some(categories) = &self.categories {
            item.categories = dedup(categories);
        }
        if let Some(timestamp) = self.timestamp {
            item.timestamp = timestamp;
        }
        if let Some(labels) = &self.labels {
            item.labels = dedup(labels);
        }
        if let Some(comment) = &self.comment {
            item.comment = comment.clone();
        }
    }
}

/// Identifies feedback: one row per (type, user, item)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedbackKey {
    pub feedback_type: String,
    pub user_id: String,
    pub item_id: String,
}

impl FeedbackKey {
    pub fn new(
        feedback_type: impl Into<String>,
        user_id: impl Into<String>,
        item_id: impl Into<String>,
    ) -> Self {
        Self {
            feedback_type: feedback_type.into(),
            user_id: user_id.into(),
            item_id: item_id.into(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.feedback_type.is_empty() {
            return Err(StorageError::invalid("feedback type must not be empty"));
        }
        require_id("user", &self.user_id)?;
        require_id("item", &self.item_id)?;
        if [&self.feedback_type, &self.user_id, &self.item_id]
            .iter()
            .any(|part| part.contains('\0'))
        {
            return Err(StorageError::invalid("feedback key must not contain NUL"));
        }
        Ok(())
    }

    pub(crate) fn conflict(&self) -> StorageError {
        StorageError::Conflict(format!(
            "feedback ({}, {}, {}) already exists",
            self.feedback_type, self.user_id, self.item_id
        ))
    }
}

/// A timestamped interaction between a user and an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(flatten)]
    pub key: FeedbackKey,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub comment: String,
}

impl Feedback {
    pub fn new(key: FeedbackKey, timestamp: DateTime<Utc>) -> Self {
        Self {
            key,
            timestamp,
            comment: String::new(),
        }
    }

    pub fn item_id(&self) -> &str {
        &self.key.item_id
    }
}

/// Sort feedback from latest to oldest, ties by key
pub fn sort_feedback(feedback: &mut [Feedback]) {
    feedback.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.key.cmp(&b.key))
    });
}

/// Listing filter for items
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
    /// Keep items with `timestamp >= time_limit`
    pub time_limit: Option<DateTime<Utc>>,
    pub include_hidden: bool,
}

impl ItemFilter {
    pub fn matches(&self, item: &Item) -> bool {
        if item.is_hidden && !self.include_hidden {
            return false;
        }
        match self.time_limit {
            Some(limit) => item.timestamp >= limit,
            None => true,
        }
    }
}

/// Listing filter for feedback
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackFilter {
    /// Keep feedback with `timestamp >= time_limit`
    pub time_limit: Option<DateTime<Utc>>,
    /// Empty means all types
    pub feedback_types: Vec<String>,
}

impl FeedbackFilter {
    pub fn with_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            time_limit: None,
            feedback_types: types.into_iter().map(Into::into).collect(),
        }
    }

    /// Future-dated feedback never matches a listing
    pub fn matches(&self, feedback: &Feedback, now: DateTime<Utc>) -> bool {
        if feedback.timestamp > now {
            return false;
        }
        if let Some(limit) = self.time_limit {
            if feedback.timestamp < limit {
                return false;
            }
        }
        type_allowed(&self.feedback_types, &feedback.key.feedback_type)
    }
}

/// Empty type list allows every type
pub(crate) fn type_allowed(types: &[String], feedback_type: &str) -> bool {
    types.is_empty() || types.iter().any(|t| t == feedback_type)
}

/// Remove duplicates keeping first-occurrence order
pub(crate) fn dedup(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(values.len());
    values
        .iter()
        .filter(|v| seen.insert(v.as_str()))
        .cloned()
        .collect()
}

fn dedup_in_place(values: &mut Vec<String>) {
    let mut seen = HashSet::with_capacity(values.len());
    values.retain(|v| seen.insert(v.clone()));
}
