//! In-process routing store

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{SeedStore, StoreError};

/// Routing store kept in a process-local map
pub struct MemoryStore {
    /// Map of name -> target
    seeds: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            seeds: RwLock::new(HashMap::new()),
        }
    }

    /// Number of entries currently held
    pub async fn len(&self) -> usize {
        self.seeds.read().await.len()
    }

    /// Whether the store holds no entries
    pub async fn is_empty(&self) -> bool {
        self.seeds.read().await.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SeedStore for MemoryStore {
    async fn seed(&self, name: &str) -> Result<String, StoreError> {
        let seeds = self.seeds.read().await;
        seeds
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn put_seed(&self, name: &str, target: &str) -> Result<(), StoreError> {
        let mut seeds = self.seeds.write().await;
        if seeds.contains_key(name) {
            debug!("Seed {} already present, keeping existing target", name);
            return Ok(());
        }
        seeds.insert(name.to_string(), target.to_string());
        debug!("Put seed {} -> {}", name, target);
        Ok(())
    }

    async fn delete_seed(&self, name: &str) -> Result<(), StoreError> {
        let mut seeds = self.seeds.write().await;
        seeds.remove(name);
        debug!("Deleted seed {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_missing_name_is_not_found() {
        contract::missing_name_is_not_found(&MemoryStore::new(), "unknown.example").await;
    }

    #[tokio::test]
    async fn test_put_then_seed() {
        contract::put_then_seed(&MemoryStore::new(), "a.example").await;
    }

    #[tokio::test]
    async fn test_first_write_wins() {
        contract::first_write_wins(&MemoryStore::new(), "a.example").await;
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        contract::delete_removes_and_is_idempotent(&MemoryStore::new(), "a.example").await;
    }

    #[tokio::test]
    async fn test_delete_then_put_replaces() {
        contract::delete_then_put_replaces(&MemoryStore::new(), "a.example").await;
    }

    #[tokio::test]
    async fn test_names_are_case_sensitive() {
        contract::names_are_case_sensitive(&MemoryStore::new(), "a.example").await;
    }

    #[tokio::test]
    async fn test_shared_targets_allowed() {
        contract::shared_targets_allowed(&MemoryStore::new(), "a.example", "b.example").await;
    }

    #[tokio::test]
    async fn test_repeated_put_is_single_entry() {
        let store = MemoryStore::new();
        store.put_seed("a.example", "http://127.0.0.1:9000").await.unwrap();
        store.put_seed("a.example", "http://127.0.0.1:9000").await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_puts_keep_one_target() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .put_seed("race.example", &format!("http://10.0.0.{i}"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.len().await, 1);
        assert!(store.seed("race.example").await.unwrap().starts_with("http://10.0.0."));
    }
}
