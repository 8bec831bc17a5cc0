//! Long-term key-value store.
//!
//! Checkpoints persist *within* a thread; the [`Store`] persists *across*
//! threads. Items live under hierarchical namespaces (e.g.
//! `["memories", user_id]`) and are addressed by key within a namespace.
//! Nodes reach the store through their execution context.

use crate::error::{GraphError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A stored item with its address and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreItem {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cross-thread persistence shared by all runs of an engine.
///
/// Writing to an existing `(namespace, key)` overwrites the value and bumps
/// `updated_at`; `created_at` is preserved.
#[async_trait]
pub trait Store: Send + Sync {
    /// Store or overwrite an item.
    async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<()>;

    /// Fetch an item, or `None` if absent.
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<StoreItem>>;

    /// Delete an item. Returns whether it existed.
    async fn delete(&self, namespace: &[String], key: &str) -> Result<bool>;

    /// Search a namespace subtree.
    ///
    /// Items under `namespace_prefix` (inclusive) whose serialized value
    /// contains `query` as a substring, most recently updated first. A
    /// `None` query matches everything.
    async fn search(
        &self,
        namespace_prefix: &[String],
        query: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoreItem>>;

    /// All namespaces currently holding at least one item.
    async fn list_namespaces(&self) -> Result<Vec<Vec<String>>>;
}

/// namespace (joined) -> key -> item.
type Items = Arc<RwLock<HashMap<Vec<String>, HashMap<String, StoreItem>>>>;

/// In-memory [`Store`] backend.
///
/// Cloning is shallow; clones share the same items.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    items: Items,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total items across all namespaces.
    pub async fn len(&self) -> usize {
        self.items.read().await.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<()> {
        if namespace.is_empty() {
            return Err(GraphError::Store("namespace must not be empty".into()));
        }
        let now = Utc::now();
        let mut items = self.items.write().await;
        let bucket = items.entry(namespace.to_vec()).or_default();
        match bucket.get_mut(key) {
            Some(existing) => {
                existing.value = value;
                existing.updated_at = now;
            }
            None => {
                bucket.insert(
                    key.to_string(),
                    StoreItem {
                        namespace: namespace.to_vec(),
                        key: key.to_string(),
                        value,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<StoreItem>> {
        let items = self.items.read().await;
        Ok(items
            .get(namespace)
            .and_then(|bucket| bucket.get(key))
            .cloned())
    }

    async fn delete(&self, namespace: &[String], key: &str) -> Result<bool> {
        let mut items = self.items.write().await;
        let Some(bucket) = items.get_mut(namespace) else {
            return Ok(false);
        };
        let removed = bucket.remove(key).is_some();
        if bucket.is_empty() {
            items.remove(namespace);
        }
        Ok(removed)
    }

    async fn search(
        &self,
        namespace_prefix: &[String],
        query: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoreItem>> {
        let items = self.items.read().await;
        let mut matches: Vec<StoreItem> = items
            .iter()
            .filter(|(ns, _)| ns.starts_with(namespace_prefix))
            .flat_map(|(_, bucket)| bucket.values())
            .filter(|item| match query {
                Some(q) => item.value.to_string().contains(q),
                None => true,
            })
            .cloned()
            .collect();

        matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn list_namespaces(&self) -> Result<Vec<Vec<String>>> {
        let items = self.items.read().await;
        let mut namespaces: Vec<Vec<String>> = items.keys().cloned().collect();
        namespaces.sort();
        Ok(namespaces)
    }
}
