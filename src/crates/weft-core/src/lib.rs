//! # weft-core - Superstep Graph Execution Engine
//!
//! Runs stateful, multi-step workflows as graphs of nodes communicating
//! through versioned channels, in bulk-synchronous supersteps:
//!
//! ```text
//!   ┌────────────────────── superstep ──────────────────────┐
//!   │ plan: which nodes are due (channel version > seen)    │
//!   │ run:  all due tasks concurrently, snapshot-isolated   │
//!   │ fold: writes applied through reducers, at the barrier │
//!   │ save: checkpoint the whole state                      │
//!   └────────────────────────────────────────────────────────┘
//!            repeat until no node is due (quiescence)
//! ```
//!
//! Because state only changes at barriers and every barrier is
//! checkpointed, runs can pause on a human-in-the-loop interrupt, survive a
//! crash, resume without re-running completed work, and fork from any point
//! in their history.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use serde_json::json;
//! use weft_core::{ChannelType, GraphBuilder, NodeOutput, RunConfig, node_fn, START};
//!
//! let engine = GraphBuilder::new()
//!     .channel("messages", ChannelType::append())
//!     .node("respond", node_fn(|input, _ctx| async move {
//!         Ok(NodeOutput::update(json!({"messages": ["hello"]})))
//!     }))
//!     .edge(START, "respond")
//!     .compile()?;
//!
//! let out = engine.invoke(json!({"messages": ["hi"]}), RunConfig::new()).await?;
//! ```
//!
//! Persistence lives in the companion `weft-checkpoint` crate; attach a
//! [`CheckpointSaver`](weft_checkpoint::CheckpointSaver) through
//! [`GraphBuilder::checkpointer`] to make threads durable.

pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod interrupt;
pub mod node;
pub mod pregel;
pub mod send;
pub mod store;
pub mod stream;

pub use command::{Command, CommandGraph, GotoTarget, ResumeValue};
pub use config::{RunConfig, DEFAULT_RECURSION_LIMIT};
pub use engine::{Engine, StateSnapshot};
pub use error::{GraphError, Result};
pub use graph::{
    is_reserved, ChannelType, GraphBuilder, NodeId, NodeSpec, END, INPUT, START,
};
pub use interrupt::{GraphInterrupt, Interrupt};
pub use node::{node_fn, NodeContext, NodeExecutor, NodeFuture, NodeOutput};
pub use pregel::{RetryPolicy, RunOutcome};
pub use send::Send;
pub use store::{InMemoryStore, Store, StoreItem};
pub use stream::{StreamEvent, StreamMode};

// Persistence types callers commonly touch.
pub use weft_checkpoint::{
    CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointTuple, InMemorySaver,
};
