//! Checkpoint storage trait for pluggable persistence backends.
//!
//! [`CheckpointSaver`] is the seam between the execution loop and storage.
//! The loop calls [`put`](CheckpointSaver::put) once per barrier,
//! [`put_writes`](CheckpointSaver::put_writes) as individual tasks complete,
//! and [`get_tuple`](CheckpointSaver::get_tuple) /
//! [`list`](CheckpointSaver::list) when resuming or inspecting history.
//! Implementations map these onto a database, a key-value store, or the
//! bundled [`InMemorySaver`](crate::memory::InMemorySaver).
//!
//! Checkpoint histories are append-only per `(thread_id, checkpoint_ns)`.
//! Storing a new checkpoint never rewrites an old one; resuming from an
//! older checkpoint id forks the history instead.
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use weft_checkpoint::{
//!     ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata,
//!     CheckpointSaver, CheckpointStream, CheckpointTuple,
//! };
//! use async_trait::async_trait;
//!
//! struct PostgresSaver { pool: sqlx::PgPool }
//!
//! #[async_trait]
//! impl CheckpointSaver for PostgresSaver {
//!     async fn get_tuple(
//!         &self,
//!         config: &CheckpointConfig,
//!     ) -> weft_checkpoint::Result<Option<CheckpointTuple>> {
//!         // SELECT by (thread_id, checkpoint_ns, checkpoint_id),
//!         // or latest for the thread when checkpoint_id is absent.
//!         todo!()
//!     }
//!     // ... put / put_writes / list ...
//! }
//! ```

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
    },
    error::Result,
};
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;

/// Async stream of checkpoint tuples, newest first.
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send + 'static>>;

/// Storage backend for checkpoints and pending writes.
///
/// Implementations must be `Send + Sync` and safe under concurrent access;
/// each `(thread_id, checkpoint_ns)` pair owns an independent history.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch just the checkpoint for the given config.
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|t| t.checkpoint))
    }

    /// Fetch a checkpoint with its metadata, parent link and pending writes.
    ///
    /// If `config.checkpoint_id` is set, that exact checkpoint is returned;
    /// otherwise the latest checkpoint for `(thread_id, checkpoint_ns)`.
    /// Returns `Ok(None)` when no checkpoint exists, not an error.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// Stream checkpoints matching the criteria, newest first.
    ///
    /// `filter` matches against metadata fields, `before` restricts to
    /// checkpoints older than the named one, `limit` caps the result count.
    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<std::collections::HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream>;

    /// Store a checkpoint. Called once per superstep barrier.
    ///
    /// Returns the config addressing the stored checkpoint (with its real
    /// checkpoint id filled in) so the caller can chain from it.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig>;

    /// Store writes produced by a single task, attributed to `task_id`.
    ///
    /// Pending writes attach to the checkpoint named by `config`. They let a
    /// resumed run skip tasks that already succeeded before an interrupt or
    /// crash, and they record interrupt markers.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: String,
    ) -> Result<()>;

    /// Delete all checkpoints and writes for a thread.
    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let _ = thread_id;
        Ok(())
    }
}
