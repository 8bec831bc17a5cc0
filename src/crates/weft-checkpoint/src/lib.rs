//! # weft-checkpoint - State Persistence for Workflow Execution
//!
//! Channels, checkpoint data structures and the [`CheckpointSaver`] trait
//! that back weft's execution engine. A checkpoint is a complete snapshot of
//! a run's shared state taken at each superstep barrier; savers persist
//! those snapshots so runs can pause, resume, recover from failure, and be
//! replayed or forked from any point in their history.
//!
//! ## Pieces
//!
//! - [`channels`] - versioned state cells with per-type write semantics:
//!   [`LastValueChannel`], [`TopicChannel`], [`BinaryOperatorChannel`],
//!   [`EphemeralValueChannel`]
//! - [`checkpoint`] - [`Checkpoint`], [`CheckpointConfig`],
//!   [`CheckpointMetadata`], [`CheckpointTuple`], [`ChannelVersion`]
//! - [`traits`] - the [`CheckpointSaver`] storage seam
//! - [`memory`] - [`InMemorySaver`] reference backend
//! - [`serializer`] - byte-level serialization strategies
//!
//! ## Flow
//!
//! ```text
//!  weft-core execution loop
//!    │  put_writes() as tasks finish
//!    │  put() at each barrier
//!    ▼
//!  CheckpointSaver ──► InMemorySaver / your database backend
//! ```
//!
//! Histories are append-only per `(thread_id, checkpoint_ns)`; resuming from
//! an older checkpoint forks the timeline rather than rewriting it.

pub mod channels;
pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod serializer;
pub mod traits;

pub use channels::{
    append_reducer, sum_reducer, BinaryOperatorChannel, Channel, EphemeralValueChannel,
    LastValueChannel, ReducerFn, TopicChannel,
};
pub use checkpoint::{
    child_namespace, ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointId,
    CheckpointMetadata, CheckpointSource, CheckpointTuple, PendingWrite, NS_SEP,
};
pub use error::{CheckpointError, Result};
pub use memory::InMemorySaver;
pub use serializer::{BincodeSerializer, JsonSerializer, SerializerProtocol};
pub use traits::{CheckpointSaver, CheckpointStream};
