//! Backend selection from connection descriptors
//!
//! A descriptor is inspected by scheme only. Relational descriptors get
//! their isolation and strict-mode parameters forced in before connecting, so
//! every dialect reads its own writes the same way. The returned [`Backend`]
//! is an explicit handle; there is no process-wide database.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use url::{form_urlencoded, Url};

use super::kv::KeyValueDatabase;
use super::sql::{SqlDatabase, SqliteOptions};
use super::stream::BatchStream;
use super::types::{Feedback, FeedbackFilter, Item, ItemFilter, ItemPatch, User, UserPatch};
use super::{Database, FeedbackInsert};
use crate::config::{StorageConfig, TimeoutConfig};
use crate::error::{Result, StorageError};
use crate::kv::{KvStore, MemoryStore, RedisStore};

const SQLITE_PREFIX: &str = "sqlite://";
const MYSQL_PREFIX: &str = "mysql://";
const POSTGRES_PREFIX: &str = "postgres://";
const POSTGRESQL_PREFIX: &str = "postgresql://";
const CLICKHOUSE_PREFIX: &str = "clickhouse://";
const CHHTTP_PREFIX: &str = "chhttp://";
const CHHTTPS_PREFIX: &str = "chhttps://";
const ORACLE_PREFIX: &str = "oracle://";
const MONGO_PREFIX: &str = "mongodb://";
const MONGO_SRV_PREFIX: &str = "mongodb+srv://";
const REDIS_PREFIX: &str = "redis://";
const MEMORY_PREFIX: &str = "memory://";

const MYSQL_SQL_MODE: &str =
    "'ONLY_FULL_GROUP_BY,STRICT_TRANS_TABLES,ERROR_FOR_DIVISION_BY_ZERO,NO_ENGINE_SUBSTITUTION'";
const MYSQL_ISOLATION: &str = "'READ-UNCOMMITTED'";
const POSTGRES_ISOLATION: &str = "-c default_transaction_isolation=read\\ uncommitted";

/// Relational dialects the router recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    MySql,
    Postgres,
    ClickHouse,
    Oracle,
}

impl SqlDialect {
    pub fn name(&self) -> &'static str {
        match self {
            SqlDialect::MySql => "mysql",
            SqlDialect::Postgres => "postgres",
            SqlDialect::ClickHouse => "clickhouse",
            SqlDialect::Oracle => "oracle",
        }
    }
}

/// A normalized connection descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Sqlite(SqliteOptions),
    /// Relational dialect with its tuned connection string
    Sql { dialect: SqlDialect, dsn: String },
    Document { uri: String, database: String },
    Redis(String),
    RedisCluster(Vec<String>),
    Memory,
}

impl Descriptor {
    /// Normalize a descriptor without connecting
    ///
    /// `operation` becomes the SQLite busy timeout unless the descriptor sets
    /// one.
    pub fn parse(descriptor: &str, operation: Duration) -> Result<Self> {
        if descriptor.is_empty() {
            return Err(StorageError::invalid("empty connection descriptor"));
        }
        if let Some(rest) = descriptor.strip_prefix(SQLITE_PREFIX) {
            return parse_sqlite(descriptor, rest, operation).map(Descriptor::Sqlite);
        }
        if let Some(name) = descriptor.strip_prefix(MYSQL_PREFIX) {
            require_body(descriptor, name)?;
            let isolation = isolation_variable_name(None);
            let dsn = append_params(
                name,
                &[
                    ("sql_mode", MYSQL_SQL_MODE),
                    (isolation, MYSQL_ISOLATION),
                    ("parseTime", "true"),
                ],
            );
            return Ok(Descriptor::Sql {
                dialect: SqlDialect::MySql,
                dsn,
            });
        }
        if descriptor.starts_with(POSTGRES_PREFIX) || descriptor.starts_with(POSTGRESQL_PREFIX) {
            let mut url = parse_url(descriptor, descriptor)?;
            let forced = url
                .query_pairs()
                .any(|(_, v)| v.contains("default_transaction_isolation"));
            if !forced {
                url.query_pairs_mut().append_pair("options", POSTGRES_ISOLATION);
            }
            return Ok(Descriptor::Sql {
                dialect: SqlDialect::Postgres,
                dsn: url.to_string(),
            });
        }
        for (prefix, scheme) in [
            (CHHTTPS_PREFIX, "https://"),
            (CHHTTP_PREFIX, "http://"),
            (CLICKHOUSE_PREFIX, "http://"),
        ] {
            if let Some(rest) = descriptor.strip_prefix(prefix) {
                require_body(descriptor, rest)?;
                let url = parse_url(descriptor, &format!("{scheme}{rest}"))?;
                return Ok(Descriptor::Sql {
                    dialect: SqlDialect::ClickHouse,
                    dsn: url.to_string(),
                });
            }
        }
        if let Some(rest) = descriptor.strip_prefix(ORACLE_PREFIX) {
            require_body(descriptor, rest)?;
            return Ok(Descriptor::Sql {
                dialect: SqlDialect::Oracle,
                dsn: descriptor.to_string(),
            });
        }
        if let Some(rest) = descriptor
            .strip_prefix(MONGO_SRV_PREFIX)
            .or_else(|| descriptor.strip_prefix(MONGO_PREFIX))
        {
            let database = mongo_database(rest).ok_or_else(|| {
                StorageError::invalid(format!("descriptor names no database: {descriptor}"))
            })?;
            return Ok(Descriptor::Document {
                uri: descriptor.to_string(),
                database,
            });
        }
        if descriptor.starts_with(REDIS_PREFIX) {
            if descriptor.contains(',') {
                let addrs: Vec<String> = descriptor
                    .split(',')
                    .filter(|addr| !addr.is_empty())
                    .map(|addr| {
                        if addr.starts_with(REDIS_PREFIX) {
                            addr.to_string()
                        } else {
                            format!("{REDIS_PREFIX}{addr}")
                        }
                    })
                    .collect();
                return Ok(Descriptor::RedisCluster(addrs));
            }
            require_body(descriptor, &descriptor[REDIS_PREFIX.len()..])?;
            return Ok(Descriptor::Redis(descriptor.to_string()));
        }
        if descriptor.starts_with(MEMORY_PREFIX) {
            return Ok(Descriptor::Memory);
        }
        Err(StorageError::UnsupportedBackend(descriptor.to_string()))
    }

    /// Backend family name for logging
    pub fn family(&self) -> &'static str {
        match self {
            Descriptor::Sqlite(_) | Descriptor::Sql { .. } => "relational",
            Descriptor::Document { .. } => "document",
            Descriptor::Redis(_) | Descriptor::RedisCluster(_) | Descriptor::Memory => "key-value",
        }
    }

    pub fn is_key_value(&self) -> bool {
        self.family() == "key-value"
    }
}

/// Name of MySQL's isolation session variable for a server version
///
/// `transaction_isolation` replaced `tx_isolation` in MySQL 5.7.20; MariaDB
/// only knows the old name. Without a version the modern name is assumed.
pub fn isolation_variable_name(server_version: Option<&str>) -> &'static str {
    const MODERN: &str = "transaction_isolation";
    const LEGACY: &str = "tx_isolation";

    let Some(version) = server_version else {
        return MODERN;
    };
    if version.to_ascii_lowercase().contains("mariadb") {
        return LEGACY;
    }
    let numbers: Vec<u32> = version
        .split(|c: char| !c.is_ascii_digit())
        .take(3)
        .map_while(|part| part.parse().ok())
        .collect();
    match numbers.as_slice() {
        [major, minor, patch] if (*major, *minor, *patch) < (5, 7, 20) => LEGACY,
        [major, minor] if (*major, *minor) < (5, 7) => LEGACY,
        [major] if *major < 5 => LEGACY,
        _ => MODERN,
    }
}

/// Normalize a table prefix: empty stays empty, otherwise it ends with `_`
pub fn normalize_table_prefix(prefix: &str) -> Result<String> {
    if prefix.is_empty() {
        return Ok(String::new());
    }
    if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StorageError::invalid(format!(
            "table prefix {prefix:?} may only contain letters, digits and '_'"
        )));
    }
    if prefix.ends_with('_') {
        Ok(prefix.to_string())
    } else {
        Ok(format!("{prefix}_"))
    }
}

fn require_body(descriptor: &str, body: &str) -> Result<()> {
    if body.is_empty() {
        return Err(StorageError::invalid(format!(
            "descriptor has no address: {descriptor}"
        )));
    }
    Ok(())
}

fn parse_url(descriptor: &str, raw: &str) -> Result<Url> {
    Url::parse(raw)
        .map_err(|e| StorageError::invalid(format!("malformed descriptor {descriptor}: {e}")))
}

fn parse_sqlite(descriptor: &str, rest: &str, operation: Duration) -> Result<SqliteOptions> {
    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
    require_body(descriptor, path)?;

    let mut pragmas = Vec::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if key != "_pragma" {
            continue;
        }
        let pragma = value
            .strip_suffix(')')
            .and_then(|v| v.split_once('('))
            .map(|(name, arg)| (name.trim().to_string(), arg.trim().to_string()))
            .ok_or_else(|| {
                StorageError::invalid(format!("malformed pragma {value:?} in {descriptor}"))
            })?;
        pragmas.push(pragma);
    }
    let has = |pragmas: &[(String, String)], name: &str| pragmas.iter().any(|(n, _)| n == name);
    if !has(&pragmas, "busy_timeout") {
        pragmas.push(("busy_timeout".into(), operation.as_millis().to_string()));
    }
    if !has(&pragmas, "journal_mode") {
        pragmas.push(("journal_mode".into(), "wal".into()));
    }

    let mut options = SqliteOptions::new(path);
    options.pragmas = pragmas;
    options.busy_timeout = operation;
    Ok(options)
}

/// Append query parameters, keeping values the descriptor already sets
fn append_params(dsn: &str, params: &[(&str, &str)]) -> String {
    let (base, query) = dsn.split_once('?').unwrap_or((dsn, ""));
    let existing: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &existing {
        serializer.append_pair(key, value);
    }
    for (key, value) in params {
        if !existing.iter().any(|(k, _)| k == key) {
            serializer.append_pair(key, value);
        }
    }
    format!("{base}?{}", serializer.finish())
}

/// Database name from the path of a MongoDB connection string
fn mongo_database(rest: &str) -> Option<String> {
    let without_query = rest.split('?').next().unwrap_or(rest);
    let (_, path) = without_query.split_once('/')?;
    let name = path.trim_matches('/');
    (!name.is_empty()).then(|| name.to_string())
}

/// Data store handle returned by the router
///
/// Uses enum dispatch over the linked backend families.
#[derive(Debug, Clone)]
pub enum Backend {
    Sql(SqlDatabase),
    KeyValue(KeyValueDatabase),
}

/// Open the data store named by `descriptor`
pub fn open_database(
    descriptor: &str,
    table_prefix: &str,
    config: &StorageConfig,
) -> Result<Backend> {
    let parsed = Descriptor::parse(descriptor, config.timeouts.operation())?;
    let prefix = normalize_table_prefix(table_prefix)?;
    if parsed.is_key_value() && !prefix.is_empty() {
        return Err(StorageError::invalid(format!(
            "table prefix is not supported for key-value store: {descriptor}"
        )));
    }

    match parsed {
        Descriptor::Sqlite(mut options) => {
            options.table_prefix = prefix;
            let db = SqlDatabase::open(&options)?;
            info!(
                family = "relational",
                dialect = "sqlite",
                path = %options.path,
                prefix = %options.table_prefix,
                "opened data store"
            );
            Ok(Backend::Sql(db))
        }
        Descriptor::Sql { dialect, .. } => Err(StorageError::UnsupportedBackend(format!(
            "{} driver is not linked: {descriptor}",
            dialect.name()
        ))),
        Descriptor::Document { .. } => Err(StorageError::UnsupportedBackend(format!(
            "mongodb driver is not linked: {descriptor}"
        ))),
        kv => {
            if matches!(kv, Descriptor::Redis(_)) {
                warn!("redis is used for testing only");
            }
            let store = connect_kv(kv, &config.timeouts)?;
            info!(family = "key-value", store = store.name(), "opened data store");
            Ok(Backend::KeyValue(KeyValueDatabase::new(store)))
        }
    }
}

/// Open a key-value store for the neighbor cache
pub fn open_kv_store(descriptor: &str, timeouts: &TimeoutConfig) -> Result<Arc<dyn KvStore>> {
    let parsed = Descriptor::parse(descriptor, timeouts.operation())?;
    if !parsed.is_key_value() {
        return Err(StorageError::UnsupportedBackend(format!(
            "{} store cannot hold the cache: {descriptor}",
            parsed.family()
        )));
    }
    let store = connect_kv(parsed, timeouts)?;
    info!(store = store.name(), "opened cache store");
    Ok(store)
}

fn connect_kv(descriptor: Descriptor, timeouts: &TimeoutConfig) -> Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match descriptor {
        Descriptor::Redis(url) => Arc::new(RedisStore::connect(&url, timeouts.redis())?),
        Descriptor::RedisCluster(urls) => {
            Arc::new(RedisStore::connect_cluster(&urls, timeouts.redis())?)
        }
        Descriptor::Memory => Arc::new(MemoryStore::new()),
        other => {
            return Err(StorageError::UnsupportedBackend(format!(
                "not a key-value descriptor: {other:?}"
            )))
        }
    };
    Ok(store)
}

impl Database for Backend {
    fn backend_name(&self) -> &'static str {
        match self {
            Self::Sql(db) => db.backend_name(),
            Self::KeyValue(db) => db.backend_name(),
        }
    }

    fn init(&self) -> Result<()> {
        match self {
            Self::Sql(db) => db.init(),
            Self::KeyValue(db) => db.init(),
        }
    }

    fn close(&self) -> Result<()> {
        match self {
            Self::Sql(db) => db.close(),
            Self::KeyValue(db) => db.close(),
        }
    }

    fn optimize(&self) -> Result<()> {
        match self {
            Self::Sql(db) => db.optimize(),
            Self::KeyValue(db) => db.optimize(),
        }
    }

    fn purge(&self) -> Result<()> {
        match self {
            Self::Sql(db) => db.purge(),
            Self::KeyValue(db) => db.purge(),
        }
    }

    fn batch_insert_users(&self, users: &[User]) -> Result<()> {
        match self {
            Self::Sql(db) => db.batch_insert_users(users),
            Self::KeyValue(db) => db.batch_insert_users(users),
        }
    }

    fn get_user(&self, user_id: &str) -> Result<User> {
        match self {
            Self::Sql(db) => db.get_user(user_id),
            Self::KeyValue(db) => db.get_user(user_id),
        }
    }

    fn delete_user(&self, user_id: &str) -> Result<()> {
        match self {
            Self::Sql(db) => db.delete_user(user_id),
            Self::KeyValue(db) => db.delete_user(user_id),
        }
    }

    fn modify_user(&self, user_id: &str, patch: &UserPatch) -> Result<()> {
        match self {
            Self::Sql(db) => db.modify_user(user_id, patch),
            Self::KeyValue(db) => db.modify_user(user_id, patch),
        }
    }

    fn get_users(&self, cursor: &str, n: usize) -> Result<(String, Vec<User>)> {
        match self {
            Self::Sql(db) => db.get_users(cursor, n),
            Self::KeyValue(db) => db.get_users(cursor, n),
        }
    }

    fn batch_insert_items(&self, items: &[Item]) -> Result<()> {
        match self {
            Self::Sql(db) => db.batch_insert_items(items),
            Self::KeyValue(db) => db.batch_insert_items(items),
        }
    }

    fn batch_get_items(&self, item_ids: &[String]) -> Result<Vec<Item>> {
        match self {
            Self::Sql(db) => db.batch_get_items(item_ids),
            Self::KeyValue(db) => db.batch_get_items(item_ids),
        }
    }

    fn get_item(&self, item_id: &str) -> Result<Item> {
        match self {
            Self::Sql(db) => db.get_item(item_id),
            Self::KeyValue(db) => db.get_item(item_id),
        }
    }

    fn delete_item(&self, item_id: &str) -> Result<()> {
        match self {
            Self::Sql(db) => db.delete_item(item_id),
            Self::KeyValue(db) => db.delete_item(item_id),
        }
    }

    fn modify_item(&self, item_id: &str, patch: &ItemPatch) -> Result<()> {
        match self {
            Self::Sql(db) => db.modify_item(item_id, patch),
            Self::KeyValue(db) => db.modify_item(item_id, patch),
        }
    }

    fn get_items(
        &self,
        cursor: &str,
        n: usize,
        filter: &ItemFilter,
    ) -> Result<(String, Vec<Item>)> {
        match self {
            Self::Sql(db) => db.get_items(cursor, n, filter),
            Self::KeyValue(db) => db.get_items(cursor, n, filter),
        }
    }

    fn batch_insert_feedback(&self, feedback: &[Feedback], flags: FeedbackInsert) -> Result<()> {
        match self {
            Self::Sql(db) => db.batch_insert_feedback(feedback, flags),
            Self::KeyValue(db) => db.batch_insert_feedback(feedback, flags),
        }
    }

    fn get_feedback(
        &self,
        cursor: &str,
        n: usize,
        filter: &FeedbackFilter,
    ) -> Result<(String, Vec<Feedback>)> {
        match self {
            Self::Sql(db) => db.get_feedback(cursor, n, filter),
            Self::KeyValue(db) => db.get_feedback(cursor, n, filter),
        }
    }

    fn get_user_feedback(
        &self,
        user_id: &str,
        with_future: bool,
        feedback_types: &[String],
    ) -> Result<Vec<Feedback>> {
        match self {
            Self::Sql(db) => db.get_user_feedback(user_id, with_future, feedback_types),
            Self::KeyValue(db) => db.get_user_feedback(user_id, with_future, feedback_types),
        }
    }

    fn get_item_feedback(
        &self,
        item_id: &str,
        feedback_types: &[String],
    ) -> Result<Vec<Feedback>> {
        match self {
            Self::Sql(db) => db.get_item_feedback(item_id, feedback_types),
            Self::KeyValue(db) => db.get_item_feedback(item_id, feedback_types),
        }
    }

    fn get_user_item_feedback(
        &self,
        user_id: &str,
        item_id: &str,
        feedback_types: &[String],
    ) -> Result<Vec<Feedback>> {
        match self {
            Self::Sql(db) => db.get_user_item_feedback(user_id, item_id, feedback_types),
            Self::KeyValue(db) => db.get_user_item_feedback(user_id, item_id, feedback_types),
        }
    }

    fn delete_user_item_feedback(
        &self,
        user_id: &str,
        item_id: &str,
        feedback_types: &[String],
    ) -> Result<usize> {
        match self {
            Self::Sql(db) => db.delete_user_item_feedback(user_id, item_id, feedback_types),
            Self::KeyValue(db) => db.delete_user_item_feedback(user_id, item_id, feedback_types),
        }
    }

    fn get_user_stream(&self, batch_size: usize) -> Result<BatchStream<User>> {
        match self {
            Self::Sql(db) => db.get_user_stream(batch_size),
            Self::KeyValue(db) => db.get_user_stream(batch_size),
        }
    }

    fn get_item_stream(&self, batch_size: usize, filter: ItemFilter) -> Result<BatchStream<Item>> {
        match self {
            Self::Sql(db) => db.get_item_stream(batch_size, filter),
            Self::KeyValue(db) => db.get_item_stream(batch_size, filter),
        }
    }

    fn get_feedback_stream(
        &self,
        batch_size: usize,
        filter: FeedbackFilter,
    ) -> Result<BatchStream<Feedback>> {
        match self {
            Self::Sql(db) => db.get_feedback_stream(batch_size, filter),
            Self::KeyValue(db) => db.get_feedback_stream(batch_size, filter),
        }
    }
}
