//! Redis-backed [`KeyValueStore`].

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::store::{KeyValueStore, StoreError};

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// A [`KeyValueStore`] over a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        info!("Connected to Redis");
        Ok(Self { conn })
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        Ok(cmd.query_async::<_, T>(&mut conn).await?)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        self.query::<()>(&cmd).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.query(redis::cmd("HGETALL").arg(key)).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.query(redis::cmd("SADD").arg(key).arg(member)).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.query(redis::cmd("SREM").arg(key).arg(member)).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.query(redis::cmd("SMEMBERS").arg(key)).await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.query(redis::cmd("SISMEMBER").arg(key).arg(member)).await
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.query(redis::cmd("LPUSH").arg(key).arg(value)).await
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
        self.query(redis::cmd("LTRIM").arg(key).arg(start).arg(stop))
            .await
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.query(redis::cmd("DEL").arg(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.query(redis::cmd("EXPIRE").arg(key).arg(ttl.as_secs().max(1)))
            .await
    }
}
