//! Relational adapter backed by SQLite
//!
//! One connection behind a mutex; every batch runs inside a transaction so
//! readers of the same handle never observe half a batch. Timestamps are
//! stored as UTC microseconds, label sets as JSON arrays.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, info};

use super::cursor;
use super::stream::BatchStream;
use super::types::{
    dedup, Feedback, FeedbackFilter, FeedbackKey, Item, ItemFilter, ItemPatch, User, UserPatch,
};
use super::{Database, FeedbackInsert};
use crate::error::{require_id, require_page_size, Result, StorageError};

/// SQLite caps bound parameters per statement
const MAX_IN_PARAMS: usize = 500;

/// Options resolved by the router from a `sqlite://` descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteOptions {
    /// File path, or `:memory:`
    pub path: String,
    /// Already normalized (empty or ending with `_`)
    pub table_prefix: String,
    /// `(name, value)` pairs applied as `PRAGMA name(value)` after connecting
    pub pragmas: Vec<(String, String)>,
    pub busy_timeout: Duration,
}

impl SqliteOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            table_prefix: String::new(),
            pragmas: Vec::new(),
            busy_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct Tables {
    users: String,
    items: String,
    feedback: String,
}

impl Tables {
    fn new(prefix: &str) -> Self {
        Self {
            users: format!("{prefix}users"),
            items: format!("{prefix}items"),
            feedback: format!("{prefix}feedback"),
        }
    }
}

struct Inner {
    conn: Mutex<Option<Connection>>,
    tables: Tables,
    path: String,
}

/// SQLite implementation of [`Database`]
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct SqlDatabase {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SqlDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlDatabase")
            .field("path", &self.inner.path)
            .field("tables", &self.inner.tables)
            .finish()
    }
}

impl SqlDatabase {
    /// Open or create a SQLite database
    pub fn open(options: &SqliteOptions) -> Result<Self> {
        let conn = if options.path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(PathBuf::from(&options.path))?
        };
        conn.busy_timeout(options.busy_timeout)?;
        for (name, value) in &options.pragmas {
            apply_pragma(&conn, name, value)?;
        }

        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(Some(conn)),
                tables: Tables::new(&options.table_prefix),
                path: options.path.clone(),
            }),
        })
    }

    /// Create an in-memory database for testing
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&SqliteOptions::new(":memory:"))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| StorageError::BackendUnavailable("database is closed".into()))?;
        f(conn)
    }

    fn tables(&self) -> &Tables {
        &self.inner.tables
    }

    fn select_users(&self) -> String {
        format!(
            "SELECT user_id, labels, subscribe, comment FROM {}",
            self.tables().users
        )
    }

    fn select_items(&self) -> String {
        format!(
            "SELECT item_id, is_hidden, categories, time_stamp, labels, comment FROM {}",
            self.tables().items
        )
    }

    fn select_feedback(&self) -> String {
        format!(
            "SELECT feedback_type, user_id, item_id, time_stamp, comment FROM {}",
            self.tables().feedback
        )
    }

    fn query_feedback(&self, sql: &str, args: Vec<Value>) -> Result<Vec<Feedback>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), feedback_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

impl Database for SqlDatabase {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn init(&self) -> Result<()> {
        let t = self.tables();
        let schema = format!(
            "CREATE TABLE IF NOT EXISTS {users} (
                user_id TEXT PRIMARY KEY,
                labels TEXT NOT NULL DEFAULT '[]',
                subscribe TEXT NOT NULL DEFAULT '[]',
                comment TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS {items} (
                item_id TEXT PRIMARY KEY,
                is_hidden INTEGER NOT NULL DEFAULT 0,
                categories TEXT NOT NULL DEFAULT '[]',
                time_stamp INTEGER NOT NULL DEFAULT 0,
                labels TEXT NOT NULL DEFAULT '[]',
                comment TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS {feedback} (
                feedback_type TEXT NOT NULL,
                user_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                time_stamp INTEGER NOT NULL,
                comment TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (feedback_type, user_id, item_id)
            );
            CREATE INDEX IF NOT EXISTS {feedback}_user_id ON {feedback} (user_id);
            CREATE INDEX IF NOT EXISTS {feedback}_item_id ON {feedback} (item_id);",
            users = t.users,
            items = t.items,
            feedback = t.feedback,
        );
        self.with_conn(|conn| {
            conn.execute_batch(&schema)?;
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        if let Some(conn) = self.inner.conn.lock().take() {
            conn.close().map_err(|(_, e)| StorageError::from(e))?;
            info!(path = %self.inner.path, "closed sqlite database");
        }
        Ok(())
    }

    fn optimize(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("ANALYZE; PRAGMA optimize;")?;
            Ok(())
        })?;
        info!(path = %self.inner.path, "optimized sqlite database");
        Ok(())
    }

    fn purge(&self) -> Result<()> {
        let t = self.tables();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for table in [&t.users, &t.items, &t.feedback] {
                tx.execute(&format!("DELETE FROM {table}"), [])?;
            }
            tx.commit()?;
            Ok(())
        })?;
        info!(path = %self.inner.path, "purged sqlite database");
        Ok(())
    }

    fn batch_insert_users(&self, users: &[User]) -> Result<()> {
        for user in users {
            require_id("user", &user.user_id)?;
        }
        if users.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} (user_id, labels, subscribe, comment) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id) DO UPDATE SET
                labels = excluded.labels,
                subscribe = excluded.subscribe,
                comment = excluded.comment",
            self.tables().users
        );
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&sql)?;
                for user in users {
                    let user = user.clone().normalized();
                    stmt.execute(params![
                        user.user_id,
                        serde_json::to_string(&user.labels)?,
                        serde_json::to_string(&user.subscribe)?,
                        user.comment,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;
        debug!(count = users.len(), "inserted users");
        Ok(())
    }

    fn get_user(&self, user_id: &str) -> Result<User> {
        require_id("user", user_id)?;
        let sql = format!("{} WHERE user_id = ?1", self.select_users());
        self.with_conn(|conn| {
            conn.query_row(&sql, params![user_id], user_from_row)
                .optional()?
                .ok_or_else(|| StorageError::user_not_found(user_id))
        })
    }

    fn delete_user(&self, user_id: &str) -> Result<()> {
        require_id("user", user_id)?;
        let sql = format!("DELETE FROM {} WHERE user_id = ?1", self.tables().users);
        self.with_conn(|conn| {
            conn.execute(&sql, params![user_id])?;
            Ok(())
        })
    }

    fn modify_user(&self, user_id: &str, patch: &UserPatch) -> Result<()> {
        require_id("user", user_id)?;
        let select = format!("{} WHERE user_id = ?1", self.select_users());
        let update = format!(
            "UPDATE {} SET labels = ?2, subscribe = ?3, comment = ?4 WHERE user_id = ?1",
            self.tables().users
        );
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut user = tx
                .query_row(&select, params![user_id], user_from_row)
                .optional()?
                .ok_or_else(|| StorageError::user_not_found(user_id))?;
            patch.apply(&mut user);
            tx.execute(
                &update,
                params![
                    user_id,
                    serde_json::to_string(&user.labels)?,
                    serde_json::to_string(&user.subscribe)?,
                    user.comment,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn get_users(&self, cursor: &str, n: usize) -> Result<(String, Vec<User>)> {
        require_page_size(n)?;
        let after: Option<String> = cursor::decode(cursor)?;
        let sql = format!(
            "{} WHERE (?1 IS NULL OR user_id > ?1) ORDER BY user_id LIMIT ?2",
            self.select_users()
        );
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![after, limit(n)], user_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        cursor::finish_page(rows, n, |u: &User| u.user_id.clone())
    }

    fn batch_insert_items(&self, items: &[Item]) -> Result<()> {
        for item in items {
            require_id("item", &item.item_id)?;
        }
        if items.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} (item_id, is_hidden, categories, time_stamp, labels, comment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (item_id) DO UPDATE SET
                is_hidden = excluded.is_hidden,
                categories = excluded.categories,
                time_stamp = excluded.time_stamp,
                labels = excluded.labels,
                comment = excluded.comment",
            self.tables().items
        );
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&sql)?;
                for item in items {
                    let item = item.clone().normalized();
                    stmt.execute(params![
                        item.item_id,
                        item.is_hidden,
                        serde_json::to_string(&item.categories)?,
                        item.timestamp.timestamp_micros(),
                        serde_json::to_string(&item.labels)?,
                        item.comment,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;
        debug!(count = items.len(), "inserted items");
        Ok(())
    }

    fn batch_get_items(&self, item_ids: &[String]) -> Result<Vec<Item>> {
        for id in item_ids {
            require_id("item", id)?;
        }
        let ids = dedup(item_ids);
        let mut items = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "{} WHERE item_id IN ({}) ORDER BY item_id",
                self.select_items(),
                placeholders(1, chunk.len())
            );
            let found = self.with_conn(|conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(chunk.iter()), item_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })?;
            items.extend(found);
        }
        items.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        Ok(items)
    }

    fn get_item(&self, item_id: &str) -> Result<Item> {
        require_id("item", item_id)?;
        let sql = format!("{} WHERE item_id = ?1", self.select_items());
        self.with_conn(|conn| {
            conn.query_row(&sql, params![item_id], item_from_row)
                .optional()?
                .ok_or_else(|| StorageError::item_not_found(item_id))
        })
    }

    fn delete_item(&self, item_id: &str) -> Result<()> {
        require_id("item", item_id)?;
        let sql = format!("DELETE FROM {} WHERE item_id = ?1", self.tables().items);
        self.with_conn(|conn| {
            conn.execute(&sql, params![item_id])?;
            Ok(())
        })
    }

    fn modify_item(&self, item_id: &str, patch: &ItemPatch) -> Result<()> {
        require_id("item", item_id)?;
        let select = format!("{} WHERE item_id = ?1", self.select_items());
        let update = format!(
            "UPDATE {} SET is_hidden = ?2, categories = ?3, time_stamp = ?4, labels = ?5,
             comment = ?6 WHERE item_id = ?1",
            self.tables().items
        );
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut item = tx
                .query_row(&select, params![item_id], item_from_row)
                .optional()?
                .ok_or_else(|| StorageError::item_not_found(item_id))?;
            patch.apply(&mut item);
            tx.execute(
                &update,
                params![
                    item_id,
                    item.is_hidden,
                    serde_json::to_string(&item.categories)?,
                    item.timestamp.timestamp_micros(),
                    serde_json::to_string(&item.labels)?,
                    item.comment,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn get_items(
        &self,
        cursor: &str,
        n: usize,
        filter: &ItemFilter,
    ) -> Result<(String, Vec<Item>)> {
        require_page_size(n)?;
        let after: Option<String> = cursor::decode(cursor)?;
        let sql = format!(
            "{} WHERE (?1 IS NULL OR item_id > ?1)
               AND (?2 OR is_hidden = 0)
               AND (?3 IS NULL OR time_stamp >= ?3)
             ORDER BY item_id LIMIT ?4",
            self.select_items()
        );
        let time_limit = filter.time_limit.map(|t| t.timestamp_micros());
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![after, filter.include_hidden, time_limit, limit(n)],
                    item_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        cursor::finish_page(rows, n, |i: &Item| i.item_id.clone())
    }

    fn batch_insert_feedback(&self, feedback: &[Feedback], flags: FeedbackInsert) -> Result<()> {
        for f in feedback {
            f.key.validate()?;
        }
        if feedback.is_empty() {
            return Ok(());
        }
        let t = self.tables();
        let insert = if flags.overwrite {
            format!(
                "INSERT INTO {} (feedback_type, user_id, item_id, time_stamp, comment)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (feedback_type, user_id, item_id) DO UPDATE SET
                    time_stamp = excluded.time_stamp,
                    comment = excluded.comment",
                t.feedback
            )
        } else {
            format!(
                "INSERT INTO {} (feedback_type, user_id, item_id, time_stamp, comment)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                t.feedback
            )
        };

        let written = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let users = ensure_present(
                &tx,
                &t.users,
                "user_id",
                flags.insert_user,
                feedback.iter().map(|f| f.key.user_id.as_str()),
            )?;
            let items = ensure_present(
                &tx,
                &t.items,
                "item_id",
                flags.insert_item,
                feedback.iter().map(|f| f.key.item_id.as_str()),
            )?;

            let mut written = 0;
            {
                let mut stmt = tx.prepare(&insert)?;
                for f in feedback {
                    if !users.contains(f.key.user_id.as_str())
                        || !items.contains(f.key.item_id.as_str())
                    {
                        continue;
                    }
                    let result = stmt.execute(params![
                        f.key.feedback_type,
                        f.key.user_id,
                        f.key.item_id,
                        f.timestamp.timestamp_micros(),
                        f.comment,
                    ]);
                    match result {
                        Ok(_) => written += 1,
                        Err(rusqlite::Error::SqliteFailure(e, _))
                            if e.code == ErrorCode::ConstraintViolation =>
                        {
                            return Err(f.key.conflict());
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            tx.commit()?;
            Ok(written)
        })?;
        debug!(count = written, skipped = feedback.len() - written, "inserted feedback");
        Ok(())
    }

    fn get_feedback(
        &self,
        cursor: &str,
        n: usize,
        filter: &FeedbackFilter,
    ) -> Result<(String, Vec<Feedback>)> {
        require_page_size(n)?;
        let after: Option<FeedbackKey> = cursor::decode(cursor)?;
        let mut sql = format!("{} WHERE time_stamp <= ?", self.select_feedback());
        let mut args = vec![Value::Integer(Utc::now().timestamp_micros())];
        if let Some(key) = after {
            sql.push_str(" AND (feedback_type, user_id, item_id) > (?, ?, ?)");
            args.extend([
                Value::Text(key.feedback_type),
                Value::Text(key.user_id),
                Value::Text(key.item_id),
            ]);
        }
        if let Some(time_limit) = filter.time_limit {
            sql.push_str(" AND time_stamp >= ?");
            args.push(Value::Integer(time_limit.timestamp_micros()));
        }
        push_type_filter(&mut sql, &mut args, &filter.feedback_types);
        sql.push_str(" ORDER BY feedback_type, user_id, item_id LIMIT ?");
        args.push(Value::Integer(limit(n)));

        let rows = self.query_feedback(&sql, args)?;
        cursor::finish_page(rows, n, |f: &Feedback| f.key.clone())
    }

    fn get_user_feedback(
        &self,
        user_id: &str,
        with_future: bool,
        feedback_types: &[String],
    ) -> Result<Vec<Feedback>> {
        require_id("user", user_id)?;
        let mut sql = format!("{} WHERE user_id = ?", self.select_feedback());
        let mut args = vec![Value::Text(user_id.to_string())];
        if !with_future {
            sql.push_str(" AND time_stamp <= ?");
            args.push(Value::Integer(Utc::now().timestamp_micros()));
        }
        push_type_filter(&mut sql, &mut args, feedback_types);
        sql.push_str(LATEST_FIRST);
        self.query_feedback(&sql, args)
    }

    fn get_item_feedback(
        &self,
        item_id: &str,
        feedback_types: &[String],
    ) -> Result<Vec<Feedback>> {
        require_id("item", item_id)?;
        let mut sql = format!(
            "{} WHERE item_id = ? AND time_stamp <= ?",
            self.select_feedback()
        );
        let mut args = vec![
            Value::Text(item_id.to_string()),
            Value::Integer(Utc::now().timestamp_micros()),
        ];
        push_type_filter(&mut sql, &mut args, feedback_types);
        sql.push_str(LATEST_FIRST);
        self.query_feedback(&sql, args)
    }

    fn get_user_item_feedback(
        &self,
        user_id: &str,
        item_id: &str,
        feedback_types: &[String],
    ) -> Result<Vec<Feedback>> {
        require_id("user", user_id)?;
        require_id("item", item_id)?;
        let mut sql = format!(
            "{} WHERE user_id = ? AND item_id = ?",
            self.select_feedback()
        );
        let mut args = vec![
            Value::Text(user_id.to_string()),
            Value::Text(item_id.to_string()),
        ];
        push_type_filter(&mut sql, &mut args, feedback_types);
        sql.push_str(LATEST_FIRST);
        self.query_feedback(&sql, args)
    }

    fn delete_user_item_feedback(
        &self,
        user_id: &str,
        item_id: &str,
        feedback_types: &[String],
    ) -> Result<usize> {
        require_id("user", user_id)?;
        require_id("item", item_id)?;
        let mut sql = format!(
            "DELETE FROM {} WHERE user_id = ? AND item_id = ?",
            self.tables().feedback
        );
        let mut args = vec![
            Value::Text(user_id.to_string()),
            Value::Text(item_id.to_string()),
        ];
        push_type_filter(&mut sql, &mut args, feedback_types);
        self.with_conn(|conn| Ok(conn.execute(&sql, params_from_iter(args.iter()))?))
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

const LATEST_FIRST: &str = " ORDER BY time_stamp DESC, feedback_type, user_id, item_id";

/// Row limit for a page fetch with one row of lookahead
fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX - 1) + 1
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn push_type_filter(sql: &mut String, args: &mut Vec<Value>, feedback_types: &[String]) {
    if feedback_types.is_empty() {
        return;
    }
    let marks = vec!["?"; feedback_types.len()].join(", ");
    sql.push_str(&format!(" AND feedback_type IN ({marks})"));
    args.extend(feedback_types.iter().cloned().map(Value::Text));
}

/// Ids that exist after the call: missing ones are created when `create` is
/// set, otherwise left out
fn ensure_present<'a>(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    column: &str,
    create: bool,
    ids: impl Iterator<Item = &'a str>,
) -> Result<HashSet<&'a str>> {
    let wanted: HashSet<&'a str> = ids.collect();
    if create {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {table} ({column}) VALUES (?1) ON CONFLICT ({column}) DO NOTHING"
        ))?;
        for id in &wanted {
            stmt.execute(params![id])?;
        }
        return Ok(wanted);
    }

    let mut stmt = tx.prepare(&format!("SELECT 1 FROM {table} WHERE {column} = ?1"))?;
    let mut present = HashSet::with_capacity(wanted.len());
    for id in wanted {
        if stmt.exists(params![id])? {
            present.insert(id);
        }
    }
    Ok(present)
}

fn apply_pragma(conn: &Connection, name: &str, value: &str) -> Result<()> {
    let valid = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };
    if !valid(name) || !valid(value) {
        return Err(StorageError::invalid(format!(
            "unsupported pragma {name}({value})"
        )));
    }
    // Some pragmas answer with a row, others with nothing
    conn.query_row(&format!("PRAGMA {name}({value})"), [], |_| Ok(()))
        .optional()?;
    Ok(())
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let micros: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp_micros(micros).ok_or(rusqlite::Error::IntegralValueOutOfRange(
        idx, micros,
    ))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get(0)?,
        labels: json_column(row, 1)?,
        subscribe: json_column(row, 2)?,
        comment: row.get(3)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        item_id: row.get(0)?,
        is_hidden: row.get(1)?,
        categories: json_column(row, 2)?,
        timestamp: time_column(row, 3)?,
        labels: json_column(row, 4)?,
        comment: row.get(5)?,
    })
}

fn feedback_from_row(row: &Row<'_>) -> rusqlite::Result<Feedback> {
    Ok(Feedback {
        key: FeedbackKey {
            feedback_type: row.get(0)?,
            user_id: row.get(1)?,
            item_id: row.get(2)?,
        },
        timestamp: time_column(row, 3)?,
        comment: row.get(4)?,
    })
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    StorageError::DeadlineExceeded(e.to_string())
                }
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    StorageError::Corrupt(e.to_string())
                }
                ErrorCode::ConstraintViolation => StorageError::Conflict(e.to_string()),
                _ => StorageError::BackendUnavailable(e.to_string()),
            },
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::InvalidColumnType(..) => StorageError::Corrupt(e.to_string()),
            _ => StorageError::BackendUnavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn open_temp(prefix: &str) -> Result<(TempDir, SqlDatabase)> {
        let temp = TempDir::new().unwrap();
        let mut options = SqliteOptions::new(temp.path().join("data.db").to_string_lossy());
        options.table_prefix = prefix.to_string();
        options.pragmas = vec![("journal_mode".into(), "wal".into())];
        let db = SqlDatabase::open(&options)?;
        db.init()?;
        Ok((temp, db))
    }

    #[test]
    fn test_sqlite_database_creation() -> Result<()> {
        let db = SqlDatabase::open_in_memory()?;
        db.init()?;
        // init is idempotent
        db.init()?;
        assert_eq!(db.backend_name(), "sqlite");
        Ok(())
    }

    #[test]
    fn test_table_prefix_applied() -> Result<()> {
        let (_temp, db) = open_temp("rec_")?;
        db.batch_insert_users(&[User::new("1")])?;
        let count: i64 = db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM rec_users", [], |row| row.get(0))?)
        })?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn test_item_round_trip_keeps_micros() -> Result<()> {
        let db = SqlDatabase::open_in_memory()?;
        db.init()?;
        let mut item = Item::new("1", ts(1660459054) + chrono::Duration::microseconds(123));
        item.labels = vec!["a".into(), "b".into()];
        db.batch_insert_items(std::slice::from_ref(&item))?;
        assert_eq!(db.get_item("1")?, item);
        Ok(())
    }

    #[test]
    fn test_overwrite_false_rejects_whole_batch() -> Result<()> {
        let db = SqlDatabase::open_in_memory()?;
        db.init()?;
        let first = Feedback::new(FeedbackKey::new("like", "u", "1"), ts(10));
        db.batch_insert_feedback(&[first.clone()], FeedbackInsert::upsert())?;

        let fresh = Feedback::new(FeedbackKey::new("like", "u", "2"), ts(20));
        let mut again = first.clone();
        again.timestamp = ts(30);
        let flags = FeedbackInsert {
            overwrite: false,
            ..FeedbackInsert::upsert()
        };
        let err = db.batch_insert_feedback(&[fresh, again], flags).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        // Nothing from the rejected batch is visible
        let stored = db.get_user_feedback("u", true, &[])?;
        assert_eq!(stored, vec![first]);
        Ok(())
    }

    #[test]
    fn test_pragma_validation() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(apply_pragma(&conn, "busy_timeout", "1000").is_ok());
        assert!(matches!(
            apply_pragma(&conn, "journal_mode", "wal; DROP TABLE x"),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_closed_database_is_unavailable() -> Result<()> {
        let db = SqlDatabase::open_in_memory()?;
        db.init()?;
        db.close()?;
        assert!(matches!(
            db.get_user("1"),
            Err(StorageError::BackendUnavailable(_))
        ));
        // closing twice is fine
        db.close()?;
        Ok(())
    }
}
