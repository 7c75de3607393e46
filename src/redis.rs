use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::cache::{CacheEntry, RemoteStore};
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;

/// Remote cache tier backed by Redis.
///
/// The multiplexed connection is opened on first use and shared by every
/// caller; it is dropped after a connection-level failure so the next call
/// reconnects.
pub struct RedisStore {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    key_prefix: String,
}

impl RedisStore {
    pub fn new(redis_url: &str, key_prefix: &str) -> Result<Self, CacheError> {
        let client = Client::open(redis_url)
            .map_err(|e| CacheError::Remote(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            key_prefix: key_prefix.to_string(),
        })
    }

    fn entry_key(&self, fingerprint: &Fingerprint) -> String {
        format!("{}{}", self.key_prefix, fingerprint)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| CacheError::Remote(format!("Failed to connect to Redis: {}", e)))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_on_failure(&self, err: &redis::RedisError) {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            *self.connection.lock().await = None;
        }
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, CacheError> {
        let mut conn = self.connection().await?;
        match cmd.query_async::<_, T>(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.reset_on_failure(&e).await;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let raw: Option<String> = self
            .query(redis::cmd("GET").arg(self.entry_key(fingerprint)))
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, entry: &CacheEntry, ttl: Duration) -> Result<(), CacheError> {
        let raw = serde_json::to_string(entry)?;
        let _: () = self
            .query(
                redis::cmd("SETEX")
                    .arg(self.entry_key(&entry.fingerprint))
                    .arg(ttl.as_secs().max(1))
                    .arg(raw),
            )
            .await?;
        Ok(())
    }

    async fn probe(&self) -> Result<(), CacheError> {
        let pong: String = self.query(&redis::cmd("PING")).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(CacheError::Remote(format!("unexpected PING reply: {}", pong)))
        }
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set_raw(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let _: () = self.query(redis::cmd("SET").arg(key).arg(value)).await?;
        Ok(())
    }
}
