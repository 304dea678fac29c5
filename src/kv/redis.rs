//! Redis client, single node or cluster
//!
//! The cluster client does its own slot routing. Single-node writes go
//! through MULTI/EXEC; cluster writes are pipelined per slot.

use std::time::Duration;

use parking_lot::Mutex;
use redis::cluster::{ClusterClientBuilder, ClusterConnection};
use redis::{Cmd, ErrorKind, FromRedisValue, RedisError, RedisResult};
use tracing::info;

use super::{KvOp, KvStore};
use crate::error::{Result, StorageError};

/// Connection deadlines for a Redis client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedisTimeouts {
    pub connect: Duration,
    pub operation: Duration,
}

impl Default for RedisTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            operation: Duration::from_secs(10),
        }
    }
}

enum Conn {
    Single(redis::Connection),
    Cluster(ClusterConnection),
}

impl Conn {
    fn query<T: FromRedisValue>(&mut self, cmd: &Cmd) -> RedisResult<T> {
        match self {
            Conn::Single(c) => cmd.query(c),
            Conn::Cluster(c) => cmd.query(c),
        }
    }

    fn pipeline<T: FromRedisValue>(&mut self, cmds: Vec<Cmd>, atomic: bool) -> RedisResult<T> {
        match self {
            Conn::Single(c) => {
                let mut pipe = redis::pipe();
                if atomic {
                    pipe.atomic();
                }
                for cmd in cmds {
                    pipe.add_command(cmd);
                }
                pipe.query(c)
            }
            Conn::Cluster(c) => {
                let mut pipe = redis::cluster::cluster_pipe();
                for cmd in cmds {
                    pipe.add_command(cmd);
                }
                pipe.query(c)
            }
        }
    }
}

/// [`KvStore`] over a Redis connection
pub struct RedisStore {
    conn: Mutex<Option<Conn>>,
    cluster: bool,
    addr: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.addr)
            .field("cluster", &self.cluster)
            .finish()
    }
}

impl RedisStore {
    /// Connect to a single node, e.g. `redis://127.0.0.1:6379/0`
    pub fn connect(url: &str, timeouts: RedisTimeouts) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| config_error(url, e))?;
        let conn = client.get_connection_with_timeout(timeouts.connect)?;
        conn.set_read_timeout(Some(timeouts.operation))?;
        conn.set_write_timeout(Some(timeouts.operation))?;
        info!(addr = %url, "connected to redis");
        Ok(Self {
            conn: Mutex::new(Some(Conn::Single(conn))),
            cluster: false,
            addr: url.to_string(),
        })
    }

    /// Connect to a cluster through its seed nodes
    pub fn connect_cluster(urls: &[String], timeouts: RedisTimeouts) -> Result<Self> {
        let joined = urls.join(",");
        let client = ClusterClientBuilder::new(urls.to_vec())
            .connection_timeout(timeouts.connect)
            .response_timeout(timeouts.operation)
            .build()
            .map_err(|e| config_error(&joined, e))?;
        let conn = client.get_connection()?;
        info!(addrs = %joined, "connected to redis cluster");
        Ok(Self {
            conn: Mutex::new(Some(Conn::Cluster(conn))),
            cluster: true,
            addr: joined,
        })
    }

    pub fn is_cluster(&self) -> bool {
        self.cluster
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Conn) -> RedisResult<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| StorageError::BackendUnavailable("redis connection is closed".into()))?;
        Ok(f(conn)?)
    }
}

impl KvStore for RedisStore {
    fn name(&self) -> &'static str {
        if self.cluster {
            "redis-cluster"
        } else {
            "redis"
        }
    }

    fn ping(&self) -> Result<()> {
        self.with_conn(|c| c.query::<String>(&redis::cmd("PING")))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.with_conn(|c| c.query(&cmd))
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        // One GET per key so the cluster client can route each to its slot
        let cmds = keys
            .iter()
            .map(|key| {
                let mut cmd = redis::cmd("GET");
                cmd.arg(key);
                cmd
            })
            .collect();
        self.with_conn(|c| c.pipeline(cmds, false))
    }

    fn range_after(&self, key: &str, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let min = match after {
            Some(after) => format!("({after}"),
            None => "-".to_string(),
        };
        let mut cmd = redis::cmd("ZRANGEBYLEX");
        cmd.arg(key).arg(min).arg("+").arg("LIMIT").arg(0).arg(limit);
        self.with_conn(|c| c.query(&cmd))
    }

    fn members(&self, key: &str) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGE");
        cmd.arg(key).arg(0).arg(-1);
        self.with_conn(|c| c.query(&cmd))
    }

    fn top(&self, key: &str, begin: usize, end: Option<usize>) -> Result<Vec<(String, f64)>> {
        let stop: i64 = match end {
            Some(end) => i64::try_from(end).unwrap_or(-1),
            None => -1,
        };
        let mut cmd = redis::cmd("ZREVRANGE");
        cmd.arg(key).arg(begin).arg(stop).arg("WITHSCORES");
        self.with_conn(|c| c.query(&cmd))
    }

    fn apply(&self, ops: Vec<KvOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let cmds = ops.into_iter().map(command).collect();
        self.with_conn(|c| c.pipeline::<()>(cmds, true))
    }

    fn flush(&self) -> Result<()> {
        self.with_conn(|c| c.query::<()>(&redis::cmd("FLUSHDB")))
    }

    fn close(&self) -> Result<()> {
        if self.conn.lock().take().is_some() {
            info!(addr = %self.addr, "closed redis connection");
        }
        Ok(())
    }
}

fn command(op: KvOp) -> Cmd {
    match op {
        KvOp::Set { key, value } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            cmd
        }
        KvOp::Del { key } => {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(key);
            cmd
        }
        KvOp::ZAdd { key, member, score } => {
            let mut cmd = redis::cmd("ZADD");
            cmd.arg(key).arg(score).arg(member);
            cmd
        }
        KvOp::ZRem { key, member } => {
            let mut cmd = redis::cmd("ZREM");
            cmd.arg(key).arg(member);
            cmd
        }
    }
}

fn config_error(addr: &str, e: RedisError) -> StorageError {
    StorageError::invalid(format!("invalid redis address {addr}: {e}"))
}

impl From<RedisError> for StorageError {
    fn from(e: RedisError) -> Self {
        if e.is_timeout() {
            return StorageError::DeadlineExceeded(e.to_string());
        }
        match e.kind() {
            ErrorKind::TypeError => StorageError::Corrupt(e.to_string()),
            ErrorKind::InvalidClientConfig => StorageError::InvalidArgument(e.to_string()),
            _ => StorageError::BackendUnavailable(e.to_string()),
        }
    }
}
