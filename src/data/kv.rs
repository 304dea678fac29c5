//! Key-value adapter
//!
//! Records are JSON documents under `user/<id>`, `item/<id>` and
//! `feedback/<key>`. Lexicographic sorted sets (`users`, `items`, `feedback`)
//! index them for paging; `user_feedback/<id>` and `item_feedback/<id>`
//! index feedback per user and per item. Each batch is a single
//! [`KvStore::apply`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::cursor;
use super::stream::BatchStream;
use super::types::{
    dedup, sort_feedback, type_allowed, Feedback, FeedbackFilter, FeedbackKey, Item, ItemFilter,
    ItemPatch, User, UserPatch,
};
use super::{Database, FeedbackInsert};
use crate::error::{require_id, require_page_size, Result, StorageError};
use crate::kv::{KvOp, KvStore};

const USERS: &str = "users";
const ITEMS: &str = "items";
const FEEDBACK: &str = "feedback";

fn user_key(user_id: &str) -> String {
    format!("user/{user_id}")
}

fn item_key(item_id: &str) -> String {
    format!("item/{item_id}")
}

fn feedback_key(member: &str) -> String {
    format!("feedback/{member}")
}

fn user_feedback_key(user_id: &str) -> String {
    format!("user_feedback/{user_id}")
}

fn item_feedback_key(item_id: &str) -> String {
    format!("item_feedback/{item_id}")
}

/// Separates the parts of a feedback index member. It sorts below every
/// other byte, so members order like `(feedback_type, user_id, item_id)`.
const SEPARATOR: char = '\0';

/// Index member for a feedback key
fn member_of(key: &FeedbackKey) -> Result<String> {
    key.validate()?;
    Ok(format!(
        "{}{SEPARATOR}{}{SEPARATOR}{}",
        key.feedback_type, key.user_id, key.item_id
    ))
}

fn key_of(member: &str) -> Result<FeedbackKey> {
    let mut parts = member.split(SEPARATOR);
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(feedback_type), Some(user_id), Some(item_id), None) => {
            Ok(FeedbackKey::new(feedback_type, user_id, item_id))
        }
        _ => Err(StorageError::Corrupt(format!(
            "bad feedback index member {member:?}"
        ))),
    }
}

/// [`Database`] over any [`KvStore`]
///
/// Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct KeyValueDatabase {
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for KeyValueDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueDatabase")
            .field("store", &self.store.name())
            .finish()
    }
}

impl KeyValueDatabase {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Decode every present value, in key order
    fn load<T: DeserializeOwned>(&self, keys: &[String]) -> Result<Vec<T>> {
        let values = self.store.get_many(keys)?;
        values
            .into_iter()
            .flatten()
            .map(|raw| Ok(serde_json::from_str(&raw)?))
            .collect()
    }

    fn load_one<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Walk an index from `after`, collecting up to `n + 1` decoded records
    /// that pass `keep`. Pages stay full even when the filter drops records.
    fn scan<T, F>(
        &self,
        index: &str,
        after: Option<String>,
        n: usize,
        to_key: fn(&str) -> String,
        keep: F,
    ) -> Result<Vec<(String, T)>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let want = n.saturating_add(1);
        let mut out = Vec::with_capacity(want.min(1024));
        let mut after = after;
        loop {
            let members = self.store.range_after(index, after.as_deref(), want)?;
            let exhausted = members.len() < want;
            let keys: Vec<String> = members.iter().map(|m| to_key(m)).collect();
            let values = self.store.get_many(&keys)?;
            for (member, raw) in members.iter().zip(values) {
                // Index entries can briefly outlive their record
                let Some(raw) = raw else { continue };
                let record: T = serde_json::from_str(&raw)?;
                if keep(&record) {
                    out.push((member.clone(), record));
                    if out.len() == want {
                        return Ok(out);
                    }
                }
            }
            if exhausted {
                return Ok(out);
            }
            after = members.last().cloned();
        }
    }

    /// Feedback keys indexed under `index_key`, narrowed by `keep`
    fn indexed_keys(
        &self,
        index_key: &str,
        keep: impl Fn(&FeedbackKey) -> bool,
    ) -> Result<Vec<(String, FeedbackKey)>> {
        let mut keys = Vec::new();
        for member in self.store.members(index_key)? {
            let key = key_of(&member)?;
            if keep(&key) {
                keys.push((member, key));
            }
        }
        Ok(keys)
    }

    fn load_feedback(&self, members: &[(String, FeedbackKey)]) -> Result<Vec<Feedback>> {
        let keys: Vec<String> = members.iter().map(|(m, _)| feedback_key(m)).collect();
        self.load(&keys)
    }

    /// Ids among `wanted` with a stored record under `to_key`
    fn existing(&self, wanted: &[&str], to_key: fn(&str) -> String) -> Result<HashSet<String>> {
        let keys: Vec<String> = wanted.iter().map(|id| to_key(id)).collect();
        let values = self.store.get_many(&keys)?;
        Ok(wanted
            .iter()
            .zip(values)
            .filter(|(_, v)| v.is_some())
            .map(|(id, _)| id.to_string())
            .collect())
    }
}

impl Database for KeyValueDatabase {
    fn backend_name(&self) -> &'static str {
        self.store.name()
    }

    fn init(&self) -> Result<()> {
        self.store.ping()
    }

    fn close(&self) -> Result<()> {
        self.store.close()
    }

    fn optimize(&self) -> Result<()> {
        Ok(())
    }

    fn purge(&self) -> Result<()> {
        self.store.flush()?;
        info!(store = self.store.name(), "purged key-value database");
        Ok(())
    }

    fn batch_insert_users(&self, users: &[User]) -> Result<()> {
        for user in users {
            require_id("user", &user.user_id)?;
        }
        if users.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::with_capacity(users.len() * 2);
        for user in users {
            let user = user.clone().normalized();
            ops.push(KvOp::set(user_key(&user.user_id), serde_json::to_string(&user)?));
            ops.push(KvOp::index(USERS, user.user_id));
        }
        self.store.apply(ops)?;
        debug!(count = users.len(), "inserted users");
        Ok(())
    }

    fn get_user(&self, user_id: &str) -> Result<User> {
        require_id("user", user_id)?;
        self.load_one(&user_key(user_id))?
            .ok_or_else(|| StorageError::user_not_found(user_id))
    }

    fn delete_user(&self, user_id: &str) -> Result<()> {
        require_id("user", user_id)?;
        self.store.apply(vec![
            KvOp::del(user_key(user_id)),
            KvOp::unindex(USERS, user_id),
        ])
    }

    fn modify_user(&self, user_id: &str, patch: &UserPatch) -> Result<()> {
        let mut user = self.get_user(user_id)?;
        patch.apply(&mut user);
        self.store
            .apply(vec![KvOp::set(user_key(user_id), serde_json::to_string(&user)?)])
    }

    fn get_users(&self, cursor: &str, n: usize) -> Result<(String, Vec<User>)> {
        require_page_size(n)?;
        let after: Option<String> = cursor::decode(cursor)?;
        let rows = self.scan(USERS, after, n, user_key, |_: &User| true)?;
        let (next, rows) = cursor::finish_page(rows, n, |(member, _)| member.clone())?;
        Ok((next, rows.into_iter().map(|(_, user)| user).collect()))
    }

    fn batch_insert_items(&self, items: &[Item]) -> Result<()> {
        for item in items {
            require_id("item", &item.item_id)?;
        }
        if items.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::with_capacity(items.len() * 2);
        for item in items {
            let item = item.clone().normalized();
            ops.push(KvOp::set(item_key(&item.item_id), serde_json::to_string(&item)?));
            ops.push(KvOp::index(ITEMS, item.item_id));
        }
        self.store.apply(ops)?;
        debug!(count = items.len(), "inserted items");
        Ok(())
    }

    fn batch_get_items(&self, item_ids: &[String]) -> Result<Vec<Item>> {
        for id in item_ids {
            require_id("item", id)?;
        }
        let keys: Vec<String> = dedup(item_ids).iter().map(|id| item_key(id)).collect();
        let mut items: Vec<Item> = self.load(&keys)?;
        items.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        Ok(items)
    }

    fn get_item(&self, item_id: &str) -> Result<Item> {
        require_id("item", item_id)?;
        self.load_one(&item_key(item_id))?
            .ok_or_else(|| StorageError::item_not_found(item_id))
    }

    fn delete_item(&self, item_id: &str) -> Result<()> {
        require_id("item", item_id)?;
        self.store.apply(vec![
            KvOp::del(item_key(item_id)),
            KvOp::unindex(ITEMS, item_id),
        ])
    }

    fn modify_item(&self, item_id: &str, patch: &ItemPatch) -> Result<()> {
        let mut item = self.get_item(item_id)?;
        patch.apply(&mut item);
        self.store
            .apply(vec![KvOp::set(item_key(item_id), serde_json::to_string(&item)?)])
    }

    fn get_items(
        &self,
        cursor: &str,
        n: usize,
        filter: &ItemFilter,
    ) -> Result<(String, Vec<Item>)> {
        require_page_size(n)?;
        let after: Option<String> = cursor::decode(cursor)?;
        let rows = self.scan(ITEMS, after, n, item_key, |item: &Item| filter.matches(item))?;
        let (next, rows) = cursor::finish_page(rows, n, |(member, _)| member.clone())?;
        Ok((next, rows.into_iter().map(|(_, item)| item).collect()))
    }

    fn batch_insert_feedback(&self, feedback: &[Feedback], flags: FeedbackInsert) -> Result<()> {
        for f in feedback {
            f.key.validate()?;
        }
        if feedback.is_empty() {
            return Ok(());
        }

        let user_ids = dedup_refs(feedback.iter().map(|f| f.key.user_id.as_str()));
        let item_ids = dedup_refs(feedback.iter().map(|f| f.key.item_id.as_str()));
        let known_users = self.existing(&user_ids, user_key)?;
        let known_items = self.existing(&item_ids, item_key)?;

        let mut ops = Vec::new();
        if flags.insert_user {
            for id in user_ids.iter().filter(|id| !known_users.contains(**id)) {
                ops.push(KvOp::set(user_key(id), serde_json::to_string(&User::new(*id))?));
                ops.push(KvOp::index(USERS, *id));
            }
        }
        if flags.insert_item {
            for id in item_ids.iter().filter(|id| !known_items.contains(**id)) {
                let item = Item::new(*id, DateTime::<Utc>::UNIX_EPOCH);
                ops.push(KvOp::set(item_key(id), serde_json::to_string(&item)?));
                ops.push(KvOp::index(ITEMS, *id));
            }
        }

        let accepted: Vec<&Feedback> = feedback
            .iter()
            .filter(|f| flags.insert_user || known_users.contains(&f.key.user_id))
            .filter(|f| flags.insert_item || known_items.contains(&f.key.item_id))
            .collect();

        // Later entries win for the same key
        let mut latest: HashMap<String, &Feedback> = HashMap::with_capacity(accepted.len());
        let mut order = Vec::with_capacity(accepted.len());
        for &f in &accepted {
            let member = member_of(&f.key)?;
            if latest.insert(member.clone(), f).is_some() {
                if !flags.overwrite {
                    return Err(f.key.conflict());
                }
            } else {
                order.push(member);
            }
        }
        if !flags.overwrite {
            let keys: Vec<String> = order.iter().map(|m| feedback_key(m)).collect();
            let present = self.store.get_many(&keys)?;
            if let Some((member, _)) = order.iter().zip(present).find(|(_, v)| v.is_some()) {
                return Err(latest[member].key.conflict());
            }
        }

        for member in &order {
            let f = latest[member];
            ops.push(KvOp::set(feedback_key(member), serde_json::to_string(f)?));
            ops.push(KvOp::index(FEEDBACK, member.as_str()));
            ops.push(KvOp::index(user_feedback_key(&f.key.user_id), member.as_str()));
            ops.push(KvOp::index(item_feedback_key(&f.key.item_id), member.as_str()));
        }
        self.store.apply(ops)?;
        debug!(
            count = accepted.len(),
            skipped = feedback.len() - accepted.len(),
            "inserted feedback"
        );
        Ok(())
    }

    fn get_feedback(
        &self,
        cursor: &str,
        n: usize,
        filter: &FeedbackFilter,
    ) -> Result<(String, Vec<Feedback>)> {
        require_page_size(n)?;
        let after = match cursor::decode::<FeedbackKey>(cursor)? {
            Some(key) => Some(member_of(&key)?),
            None => None,
        };
        let now = Utc::now();
        let rows = self.scan(FEEDBACK, after, n, feedback_key, |f: &Feedback| {
            filter.matches(f, now)
        })?;
        let (next, rows) = cursor::finish_page(rows, n, |(_, f)| f.key.clone())?;
        Ok((next, rows.into_iter().map(|(_, f)| f).collect()))
    }

    fn get_user_feedback(
        &self,
        user_id: &str,
        with_future: bool,
        feedback_types: &[String],
    ) -> Result<Vec<Feedback>> {
        require_id("user", user_id)?;
        let members = self.indexed_keys(&user_feedback_key(user_id), |key| {
            type_allowed(feedback_types, &key.feedback_type)
        })?;
        let now = Utc::now();
        let mut feedback: Vec<Feedback> = self
            .load_feedback(&members)?
            .into_iter()
            .filter(|f| with_future || f.timestamp <= now)
            .collect();
        sort_feedback(&mut feedback);
        Ok(feedback)
    }

    fn get_item_feedback(
        &self,
        item_id: &str,
        feedback_types: &[String],
    ) -> Result<Vec<Feedback>> {
        require_id("item", item_id)?;
        let members = self.indexed_keys(&item_feedback_key(item_id), |key| {
            type_allowed(feedback_types, &key.feedback_type)
        })?;
        let now = Utc::now();
        let mut feedback: Vec<Feedback> = self
            .load_feedback(&members)?
            .into_iter()
            .filter(|f| f.timestamp <= now)
            .collect();
        sort_feedback(&mut feedback);
        Ok(feedback)
    }

    fn get_user_item_feedback(
        &self,
        user_id: &str,
        item_id: &str,
        feedback_types: &[String],
    ) -> Result<Vec<Feedback>> {
        require_id("user", user_id)?;
        require_id("item", item_id)?;
        let members = self.indexed_keys(&user_feedback_key(user_id), |key| {
            key.item_id == item_id && type_allowed(feedback_types, &key.feedback_type)
        })?;
        let mut feedback = self.load_feedback(&members)?;
        sort_feedback(&mut feedback);
        Ok(feedback)
    }

    fn delete_user_item_feedback(
        &self,
        user_id: &str,
        item_id: &str,
        feedback_types: &[String],
    ) -> Result<usize> {
        require_id("user", user_id)?;
        require_id("item", item_id)?;
        let members = self.indexed_keys(&user_feedback_key(user_id), |key| {
            key.item_id == item_id && type_allowed(feedback_types, &key.feedback_type)
        })?;
        let keys: Vec<String> = members.iter().map(|(m, _)| feedback_key(m)).collect();
        let present = self.store.get_many(&keys)?;
        let deleted = present.iter().filter(|v| v.is_some()).count();

        let mut ops = Vec::with_capacity(members.len() * 4);
        for (member, _) in &members {
            ops.push(KvOp::del(feedback_key(member)));
            ops.push(KvOp::unindex(FEEDBACK, member.as_str()));
            ops.push(KvOp::unindex(user_feedback_key(user_id), member.as_str()));
            ops.push(KvOp::unindex(item_feedback_key(item_id), member.as_str()));
        }
        self.store.apply(ops)?;
        Ok(deleted)
    }

    fn get_user_stream(&self, batch_size: usize) -> Result<BatchStream<User>> {
        let db = self.clone();
        BatchStream::spawn("users", batch_size, move |cursor, n| db.get_users(cursor, n))
    }

    fn get_item_stream(&self, batch_size: usize, filter: ItemFilter) -> Result<BatchStream<Item>> {
        let db = self.clone();
        BatchStream::spawn("items", batch_size, move |cursor, n| {
            db.get_items(cursor, n, &filter)
        })
    }

    fn get_feedback_stream(
        &self,
        batch_size: usize,
        filter: FeedbackFilter,
    ) -> Result<BatchStream<Feedback>> {
        let db = self.clone();
        BatchStream::spawn("feedback", batch_size, move |cursor, n| {
            db.get_feedback(cursor, n, &filter)
        })
    }
}

fn dedup_refs<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}
