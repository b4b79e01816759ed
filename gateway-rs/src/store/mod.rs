//! Routing store
//!
//! Maps a requested hostname (the "seed" name) to the backend target URL
//! that traffic for it is forwarded to. The same store decides whether a
//! hostname may obtain a certificate, so writes to it are the trust boundary
//! of the whole gateway.
//!
//! Two backends implement [`SeedStore`]:
//!
//! - [`MemoryStore`]: process-local map, used for development and tests
//! - [`RedisStore`]: shared Redis instance, used in production
//!
//! Neither backend caches: every lookup reflects the latest committed write.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Routing store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No entry exists for the name
    #[error("no matching seed with {0} could be found")]
    NotFound(String),

    /// The store could not be reached or answered with an error
    #[error("routing store unavailable: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this is the expected "no entry" outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Hostname to target mapping
///
/// Implementations must be safe to share between listeners and requests;
/// they own any pooling or locking they need.
#[async_trait]
pub trait SeedStore: Send + Sync {
    /// Exact-match lookup of the target for `name`
    async fn seed(&self, name: &str) -> Result<String, StoreError>;

    /// Create the entry if `name` has none; an existing entry is kept as is
    async fn put_seed(&self, name: &str, target: &str) -> Result<(), StoreError>;

    /// Remove the entry for `name`; removing an absent name succeeds
    async fn delete_seed(&self, name: &str) -> Result<(), StoreError>;
}

/// Store handle shared by every component
pub type SharedStore = Arc<dyn SeedStore>;

/// Build the configured store backend
pub async fn connect(config: &StoreConfig) -> crate::Result<SharedStore> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory routing store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => {
            let redis = RedisStore::connect(&config.redis).await?;
            Ok(Arc::new(redis))
        }
    }
}

/// Store contract checks shared by every backend's tests
#[cfg(test)]
pub(crate) mod contract {
    use super::*;

    pub async fn missing_name_is_not_found(store: &dyn SeedStore, name: &str) {
        let err = store.seed(name).await.unwrap_err();
        assert!(err.is_not_found(), "expected NotFound, got {err:?}");
    }

    pub async fn put_then_seed(store: &dyn SeedStore, name: &str) {
        store.put_seed(name, "http://127.0.0.1:9000").await.unwrap();
        assert_eq!(store.seed(name).await.unwrap(), "http://127.0.0.1:9000");
    }

    pub async fn first_write_wins(store: &dyn SeedStore, name: &str) {
        store.put_seed(name, "http://first.internal").await.unwrap();
        store.put_seed(name, "http://second.internal").await.unwrap();
        assert_eq!(store.seed(name).await.unwrap(), "http://first.internal");
    }

    pub async fn delete_removes_and_is_idempotent(store: &dyn SeedStore, name: &str) {
        store.put_seed(name, "http://127.0.0.1:9000").await.unwrap();
        store.delete_seed(name).await.unwrap();
        assert!(store.seed(name).await.unwrap_err().is_not_found());

        // second delete of an absent name is not an error
        store.delete_seed(name).await.unwrap();
        assert!(store.seed(name).await.unwrap_err().is_not_found());
    }

    pub async fn delete_then_put_replaces(store: &dyn SeedStore, name: &str) {
        store.put_seed(name, "http://old.internal").await.unwrap();
        store.delete_seed(name).await.unwrap();
        store.put_seed(name, "http://new.internal").await.unwrap();
        assert_eq!(store.seed(name).await.unwrap(), "http://new.internal");
    }

    pub async fn names_are_case_sensitive(store: &dyn SeedStore, name: &str) {
        store.put_seed(name, "http://127.0.0.1:9000").await.unwrap();
        let upper = name.to_uppercase();
        assert!(store.seed(&upper).await.unwrap_err().is_not_found());
    }

    pub async fn shared_targets_allowed(store: &dyn SeedStore, a: &str, b: &str) {
        store.put_seed(a, "http://shared.internal").await.unwrap();
        store.put_seed(b, "http://shared.internal").await.unwrap();
        assert_eq!(store.seed(a).await.unwrap(), store.seed(b).await.unwrap());
    }
}
