//! Redis-backed routing store
//!
//! Entries live under `{prefix}:{name}`. Every operation is a single round
//! trip bounded by the configured timeout, and nothing is cached locally, so
//! all gateway processes sharing the Redis instance see the same table.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{SeedStore, StoreError};
use crate::config::RedisConfig;
use crate::error::{GatewayError, Result};

/// Routing store backed by a Redis server
pub struct RedisStore {
    /// Reconnecting connection, cloned per operation
    conn: ConnectionManager,
    /// Key namespace
    prefix: String,
    /// Upper bound for a single operation
    timeout: Duration,
}

impl RedisStore {
    /// Connect using the gateway configuration and verify the server answers
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        info!("Connecting to redis at {}:{}", config.host, config.port);

        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: RedisConnectionInfo {
                password: config.password.clone().filter(|p| !p.is_empty()),
                ..Default::default()
            },
        };
        let client = ::redis::Client::open(info)
            .map_err(|e| GatewayError::Config(format!("Invalid redis settings: {}", e)))?;

        Self::from_client(
            client,
            config.prefix.clone(),
            Duration::from_millis(config.timeout_ms),
        )
        .await
    }

    /// Connect with an already configured client
    pub async fn from_client(
        client: ::redis::Client,
        prefix: String,
        timeout: Duration,
    ) -> Result<Self> {
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Backend("timed out connecting to redis".to_string()))?
            .map_err(|e| StoreError::Backend(format!("could not connect to redis: {}", e)))?;

        let store = Self {
            conn,
            prefix,
            timeout,
        };
        store.ping().await?;
        info!("Redis routing store ready (prefix {:?})", store.prefix);

        Ok(store)
    }

    async fn ping(&self) -> std::result::Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = self
            .bounded(async move { ::redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        debug!("Redis answered {}", pong);
        Ok(())
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    async fn bounded<T, F>(&self, op: F) -> std::result::Result<T, StoreError>
    where
        F: std::future::Future<Output = ::redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Backend(e.to_string())),
            Err(_) => Err(StoreError::Backend(format!(
                "redis did not answer within {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl SeedStore for RedisStore {
    async fn seed(&self, name: &str) -> std::result::Result<String, StoreError> {
        let key = self.key(name);
        let mut conn = self.conn.clone();
        let target: Option<String> = self.bounded(async move { conn.get(&key).await }).await?;
        target.ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn put_seed(&self, name: &str, target: &str) -> std::result::Result<(), StoreError> {
        let key = self.key(name);
        let mut conn = self.conn.clone();
        let created: bool = self
            .bounded(async move { conn.set_nx(&key, target).await })
            .await?;
        if created {
            debug!("Put seed {} -> {}", name, target);
        } else {
            debug!("Seed {} already present, keeping existing target", name);
        }
        Ok(())
    }

    async fn delete_seed(&self, name: &str) -> std::result::Result<(), StoreError> {
        let key = self.key(name);
        let mut conn = self.conn.clone();
        let removed: i64 = self.bounded(async move { conn.del(&key).await }).await?;
        debug!("Deleted seed {} ({} key removed)", name, removed);
        Ok(())
    }
}
