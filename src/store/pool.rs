//! Redis-protocol connection pools
//!
//! Connections are dialed lazily and checked out per operation.

use super::{Backend, Dialer, HashDecision};
use crate::error::{Error, Result};
use r2d2::{Pool, PooledConnection};
use redis::{Client, RedisError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Pool of connections to one endpoint
pub struct RedisPool {
    address: String,
    pool: Pool<Client>,
}

impl RedisPool {
    /// Create a pool without dialing
    pub fn open(address: &str, max_size: u32, connect_timeout: Duration) -> Result<Self> {
        let url = if address.contains("://") {
            address.to_string()
        } else {
            format!("redis://{}/", address)
        };
        let client = Client::open(url.as_str()).map_err(|e| Error::StoreUnavailable {
            address: address.to_string(),
            message: e.to_string(),
        })?;

        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(0))
            .connection_timeout(connect_timeout)
            .build_unchecked(client);

        Ok(Self {
            address: address.to_string(),
            pool,
        })
    }

    fn conn(&self) -> Result<PooledConnection<Client>> {
        self.pool.get().map_err(|e| Error::StoreUnavailable {
            address: self.address.clone(),
            message: e.to_string(),
        })
    }

    fn command_error(&self, e: RedisError) -> Error {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
            Error::StoreUnavailable {
                address: self.address.clone(),
                message: e.to_string(),
            }
        } else {
            Error::Store(format!("{}: {}", self.address, e))
        }
    }
}

impl Backend for RedisPool {
    fn address(&self) -> &str {
        &self.address
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        redis::cmd("GET")
            .arg(key)
            .query(&mut *conn)
            .map_err(|e| self.command_error(e))
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn()?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query(&mut *conn)
            .map_err(|e| self.command_error(e))
    }

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn()?;
        redis::cmd("HGETALL")
            .arg(key)
            .query(&mut *conn)
            .map_err(|e| self.command_error(e))
    }

    fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query(&mut *conn)
            .map_err(|e| self.command_error(e))?;
        Ok(removed > 0)
    }

    fn hash_compare_and_set(
        &self,
        key: &str,
        decide: &mut HashDecision<'_>,
    ) -> Result<Option<(String, String)>> {
        let mut conn = self.conn()?;
        // WATCH/MULTI/EXEC; the closure reruns whenever EXEC aborts
        redis::transaction(&mut *conn, &[key], |conn, pipe| {
            let current: HashMap<String, String> = redis::cmd("HGETALL").arg(key).query(conn)?;
            let Some((field, value)) = decide(&current) else {
                return Ok(Some(None));
            };
            let committed: Option<()> = pipe.hset(key, &field, &value).ignore().query(conn)?;
            if committed.is_none() {
                trace!(key = %key, "lease table changed during reservation, retrying");
            }
            Ok(committed.map(|()| Some((field, value))))
        })
        .map_err(|e| self.command_error(e))
    }
}

/// Dials `RedisPool`s sharing one pool configuration
#[derive(Debug, Clone)]
pub struct RedisDialer {
    pool_size: u32,
    connect_timeout: Duration,
}

impl RedisDialer {
    pub fn new(pool_size: u32, connect_timeout: Duration) -> Self {
        Self {
            pool_size,
            connect_timeout,
        }
    }
}

impl Dialer for RedisDialer {
    fn dial(&self, address: &str) -> Result<Arc<dyn Backend>> {
        let pool: Arc<dyn Backend> =
            Arc::new(RedisPool::open(address, self.pool_size, self.connect_timeout)?);
        Ok(pool)
    }
}
