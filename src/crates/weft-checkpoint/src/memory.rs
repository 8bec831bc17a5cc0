//! In-memory checkpoint saver.
//!
//! [`InMemorySaver`] is the reference [`CheckpointSaver`] backend: checkpoint
//! histories held in process memory behind a `tokio::sync::RwLock`, isolated
//! per `(thread_id, checkpoint_ns)`. Suitable for tests, development and
//! single-process deployments; nothing survives a restart.

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
        PendingWrite,
    },
    error::{CheckpointError, Result},
    traits::{CheckpointSaver, CheckpointStream},
};
use async_trait::async_trait;
use futures::stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CheckpointEntry {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    config: CheckpointConfig,
    parent_config: Option<CheckpointConfig>,
    writes: Vec<PendingWrite>,
}

impl CheckpointEntry {
    fn to_tuple(&self) -> CheckpointTuple {
        CheckpointTuple {
            config: self.config.clone(),
            checkpoint: self.checkpoint.clone(),
            metadata: self.metadata.clone(),
            parent_config: self.parent_config.clone(),
            pending_writes: if self.writes.is_empty() {
                None
            } else {
                Some(self.writes.clone())
            },
        }
    }
}

/// thread_id -> checkpoint_ns -> append-only history.
type Storage = Arc<RwLock<HashMap<String, HashMap<String, Vec<CheckpointEntry>>>>>;

/// In-memory checkpoint saver.
///
/// Cloning is shallow; clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemorySaver {
    storage: Storage,
}

impl InMemorySaver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of threads with at least one checkpoint.
    pub async fn thread_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Total checkpoints across all threads and namespaces.
    pub async fn checkpoint_count(&self) -> usize {
        self.storage
            .read()
            .await
            .values()
            .flat_map(|namespaces| namespaces.values())
            .map(|entries| entries.len())
            .sum()
    }

    /// Drop everything. Useful between tests.
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }

    fn thread_id_of(config: &CheckpointConfig) -> Result<&String> {
        config
            .thread_id
            .as_ref()
            .ok_or_else(|| CheckpointError::Invalid("thread_id is required".to_string()))
    }
}

#[async_trait]
impl CheckpointSaver for InMemorySaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let storage = self.storage.read().await;
        let thread_id = Self::thread_id_of(config)?;

        let Some(entries) = storage
            .get(thread_id)
            .and_then(|namespaces| namespaces.get(config.namespace()))
        else {
            return Ok(None);
        };

        let entry = match &config.checkpoint_id {
            Some(checkpoint_id) => entries.iter().find(|e| &e.checkpoint.id == checkpoint_id),
            None => entries.last(),
        };

        Ok(entry.map(CheckpointEntry::to_tuple))
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let storage = self.storage.read().await;

        let thread_ids: Vec<String> = match config.and_then(|c| c.thread_id.clone()) {
            Some(thread_id) => vec![thread_id],
            None => storage.keys().cloned().collect(),
        };
        let namespace = config.map(|c| c.namespace().to_string());

        let mut results = Vec::new();
        'threads: for thread_id in thread_ids {
            let Some(namespaces) = storage.get(&thread_id) else {
                continue;
            };
            for (ns, entries) in namespaces {
                if let Some(wanted) = &namespace {
                    if ns != wanted {
                        continue;
                    }
                }
                // Newest first within a history.
                for entry in entries.iter().rev() {
                    if let Some(before_id) =
                        before.and_then(|cfg| cfg.checkpoint_id.as_ref())
                    {
                        if entry.checkpoint.id.as_str() >= before_id.as_str() {
                            continue;
                        }
                    }

                    if let Some(filter_map) = &filter {
                        let matches = filter_map
                            .iter()
                            .all(|(key, value)| entry.metadata.extra.get(key) == Some(value));
                        if !matches {
                            continue;
                        }
                    }

                    results.push(Ok(entry.to_tuple()));
                    if limit.is_some_and(|lim| results.len() >= lim) {
                        break 'threads;
                    }
                }
            }
        }

        Ok(Box::pin(stream::iter(results)))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        let thread_id = Self::thread_id_of(config)?.clone();
        let namespace = config.namespace().to_string();

        let mut storage = self.storage.write().await;
        let entries = storage
            .entry(thread_id.clone())
            .or_default()
            .entry(namespace.clone())
            .or_default();

        let checkpoint_config = CheckpointConfig {
            thread_id: Some(thread_id),
            checkpoint_id: Some(checkpoint.id.clone()),
            checkpoint_ns: Some(namespace),
            extra: config.extra.clone(),
        };

        entries.push(CheckpointEntry {
            checkpoint,
            metadata,
            config: checkpoint_config.clone(),
            parent_config: config.checkpoint_id.as_ref().map(|_| config.clone()),
            writes: Vec::new(),
        });

        Ok(checkpoint_config)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: String,
    ) -> Result<()> {
        let thread_id = Self::thread_id_of(config)?.clone();
        let checkpoint_id = config
            .checkpoint_id
            .as_ref()
            .ok_or_else(|| CheckpointError::Invalid("checkpoint_id is required".to_string()))?;

        let mut storage = self.storage.write().await;
        let entry = storage
            .get_mut(&thread_id)
            .and_then(|namespaces| namespaces.get_mut(config.namespace()))
            .and_then(|entries| {
                entries
                    .iter_mut()
                    .find(|e| &e.checkpoint.id == checkpoint_id)
            })
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.clone()))?;

        for (channel, value) in writes {
            entry.writes.push((task_id.clone(), channel, value));
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.storage.write().await.remove(thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSource;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn save_and_load_checkpoint() {
        let saver = InMemorySaver::new();
        let checkpoint = Checkpoint::empty();
        let metadata = CheckpointMetadata::new().with_source(CheckpointSource::Input);
        let config = CheckpointConfig::new().with_thread_id("thread-1".to_string());

        let saved = saver
            .put(&config, checkpoint.clone(), metadata, HashMap::new())
            .await
            .unwrap();
        assert_eq!(saved.checkpoint_id, Some(checkpoint.id.clone()));

        let tuple = saver.get_tuple(&saved).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, checkpoint.id);
        assert!(tuple.pending_writes.is_none());
    }

    #[tokio::test]
    async fn latest_wins_without_checkpoint_id() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new().with_thread_id("thread-1".to_string());

        let mut last_id = String::new();
        for step in 0..3 {
            let checkpoint = Checkpoint::empty();
            last_id = checkpoint.id.clone();
            saver
                .put(
                    &config,
                    checkpoint,
                    CheckpointMetadata::new().with_step(step),
                    HashMap::new(),
                )
                .await
                .unwrap();
        }

        let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, last_id);
        assert_eq!(tuple.metadata.step, Some(2));
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let saver = InMemorySaver::new();
        let root = CheckpointConfig::new().with_thread_id("thread-1".to_string());
        let child = root.clone().with_checkpoint_ns("outer|work".to_string());

        saver
            .put(&root, Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();

        // The child namespace has its own (empty) history.
        assert!(saver.get_tuple(&child).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_newest_first_with_limit() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new().with_thread_id("thread-1".to_string());

        for step in 0..5 {
            saver
                .put(
                    &config,
                    Checkpoint::empty(),
                    CheckpointMetadata::new().with_step(step),
                    HashMap::new(),
                )
                .await
                .unwrap();
        }

        let stream = saver.list(Some(&config), None, None, Some(2)).await.unwrap();
        let results: Vec<_> = stream.collect().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().metadata.step, Some(4));
        assert_eq!(results[1].as_ref().unwrap().metadata.step, Some(3));
    }

    #[tokio::test]
    async fn list_filters_on_metadata() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new().with_thread_id("thread-1".to_string());

        saver
            .put(
                &config,
                Checkpoint::empty(),
                CheckpointMetadata::new().with_extra("approved".into(), json!(true)),
                HashMap::new(),
            )
            .await
            .unwrap();
        saver
            .put(
                &config,
                Checkpoint::empty(),
                CheckpointMetadata::new().with_extra("approved".into(), json!(false)),
                HashMap::new(),
            )
            .await
            .unwrap();

        let mut filter = HashMap::new();
        filter.insert("approved".to_string(), json!(true));
        let stream = saver
            .list(Some(&config), Some(filter), None, None)
            .await
            .unwrap();
        let results: Vec<_> = stream.collect().await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn pending_writes_round_trip() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new().with_thread_id("thread-1".to_string());

        let saved = saver
            .put(&config, Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();

        saver
            .put_writes(
                &saved,
                vec![("messages".to_string(), json!("partial"))],
                "task-a".to_string(),
            )
            .await
            .unwrap();

        let tuple = saver.get_tuple(&saved).await.unwrap().unwrap();
        let writes = tuple.pending_writes.unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "task-a");
        assert_eq!(writes[0].1, "messages");
    }

    #[tokio::test]
    async fn put_writes_requires_existing_checkpoint() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new()
            .with_thread_id("thread-1".to_string())
            .with_checkpoint_id("nope".to_string());

        let err = saver
            .put_writes(&config, vec![("c".into(), json!(1))], "t".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_thread_removes_history() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new().with_thread_id("thread-1".to_string());

        saver
            .put(&config, Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(saver.thread_count().await, 1);

        saver.delete_thread("thread-1").await.unwrap();
        assert_eq!(saver.thread_count().await, 0);
    }
}
