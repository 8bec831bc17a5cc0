//! Checkpoint data structures for state persistence and time-travel.
//!
//! A [`Checkpoint`] is a complete snapshot of graph execution state taken at
//! a superstep barrier: every channel's value and version, the per-node map
//! of versions already seen, and any routing messages produced but not yet
//! scheduled. Together with [`CheckpointConfig`] (which checkpoint),
//! [`CheckpointMetadata`] (how it was created) and [`CheckpointTuple`] (the
//! full record a saver hands back), these types are the unit of persistence,
//! recovery and replay.
//!
//! # Structure
//!
//! ```text
//! CheckpointTuple
//! ├── CheckpointConfig   thread_id / checkpoint_ns / checkpoint_id
//! ├── Checkpoint
//! │   ├── channel_values    {"messages": [...], "total": 7}
//! │   ├── channel_versions  {"messages": 5, "total": 2}
//! │   ├── versions_seen     {"analyzer": {"messages": 4}}
//! │   └── pending_sends     [Send-encoded values awaiting scheduling]
//! ├── CheckpointMetadata source / step / parents / extra
//! ├── parent_config      previous checkpoint in the chain
//! └── pending_writes     successful task writes not yet at a barrier
//! ```
//!
//! # Versions seen
//!
//! `versions_seen` drives scheduling: a node runs when one of its trigger
//! channels has a version strictly greater than the version recorded for
//! that node. Version values only ever increase within a thread, so "has
//! this node processed this data" is a single comparison.
//!
//! # Histories and forks
//!
//! Checkpoints are append-only. Resuming from an older checkpoint id does
//! not rewrite history; new checkpoints record the old one as their parent,
//! forming a fork. `metadata.parents` maps each checkpoint namespace to the
//! parent checkpoint id in that namespace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

/// Checkpoint ID type.
pub type CheckpointId = String;

/// Separator between levels of a checkpoint namespace.
///
/// A subgraph invoked by node `work` inside node `outer` runs under the
/// namespace `"outer|work"`. The root graph's namespace is the empty string.
pub const NS_SEP: &str = "|";

/// Build the namespace of a child graph invoked by `node` under `parent_ns`.
pub fn child_namespace(parent_ns: &str, node: &str) -> String {
    if parent_ns.is_empty() {
        node.to_string()
    } else {
        format!("{parent_ns}{NS_SEP}{node}")
    }
}

/// Pending write tuple: (task_id, channel, value).
///
/// A write produced by a completed task that has not yet been folded into a
/// checkpoint at a barrier. Savers persist these so that resuming an
/// interrupted superstep does not re-run tasks that already succeeded.
pub type PendingWrite = (String, String, serde_json::Value);

/// Channel version - an opaque, totally ordered, monotonically increasing
/// value. Integers are the default; floats and strings are accepted so that
/// savers with their own version schemes can round-trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ChannelVersion {
    Int(i64),
    Float(f64),
    String(String),
}

impl ChannelVersion {
    /// The next version after this one.
    pub fn next(&self) -> Self {
        match self {
            ChannelVersion::Int(v) => ChannelVersion::Int(v + 1),
            ChannelVersion::Float(v) => ChannelVersion::Float(v + 1.0),
            ChannelVersion::String(s) => {
                // Lexicographic successor: zero-padded counter prefix.
                let counter = s
                    .split('.')
                    .next()
                    .and_then(|p| p.parse::<u64>().ok())
                    .unwrap_or(0);
                ChannelVersion::String(format!("{:032}", counter + 1))
            }
        }
    }
}

impl std::fmt::Display for ChannelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelVersion::Int(v) => write!(f, "{v}"),
            ChannelVersion::Float(v) => write!(f, "{v}"),
            ChannelVersion::String(s) => write!(f, "{s}"),
        }
    }
}

impl PartialOrd for ChannelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        use ChannelVersion::*;
        match (self, other) {
            (Int(a), Int(b)) => a.partial_cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (String(a), String(b)) => a.partial_cmp(b),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            // Numeric versions sort before string versions.
            (Int(_) | Float(_), String(_)) => Some(Ordering::Less),
            (String(_), Int(_) | Float(_)) => Some(Ordering::Greater),
        }
    }
}

/// Mapping from channel name to version.
pub type ChannelVersions = HashMap<String, ChannelVersion>;

/// How a checkpoint came to exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Created when input was seeded at the start of a run.
    Input,
    /// Created at a superstep barrier.
    Loop,
    /// Created by a manual state update.
    Update,
    /// Created as a copy of another checkpoint.
    Fork,
}

/// Metadata associated with a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// Superstep number: -1 for the input checkpoint, 0 for the first
    /// barrier, n for the nth afterwards.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i32>,

    /// Parent checkpoint ids, keyed by checkpoint namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<HashMap<String, String>>,

    /// Additional custom metadata.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_step(mut self, step: i32) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_parents(mut self, parents: HashMap<String, String>) -> Self {
        self.parents = Some(parents);
        self
    }

    pub fn with_extra(mut self, key: String, value: serde_json::Value) -> Self {
        self.extra.insert(key, value);
        self
    }
}

/// State snapshot at a superstep barrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint format version (currently 1).
    pub v: i32,

    /// Unique checkpoint id, monotonically increasing within a thread.
    pub id: CheckpointId,

    /// When the checkpoint was taken.
    pub ts: DateTime<Utc>,

    /// Serialized snapshot of each available channel.
    pub channel_values: HashMap<String, serde_json::Value>,

    /// Version of each channel at the time of the snapshot.
    pub channel_versions: ChannelVersions,

    /// Per-node map of channel versions already processed. Drives the
    /// version-based trigger check at scheduling time.
    pub versions_seen: HashMap<String, ChannelVersions>,

    /// Send messages produced in the superstep that created this checkpoint,
    /// to be scheduled as push tasks in the next one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_sends: Vec<serde_json::Value>,

    /// Channels whose version was bumped at this barrier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_channels: Option<Vec<String>>,
}

impl Checkpoint {
    pub const CURRENT_VERSION: i32 = 1;

    pub fn new(
        id: CheckpointId,
        channel_values: HashMap<String, serde_json::Value>,
        channel_versions: ChannelVersions,
        versions_seen: HashMap<String, ChannelVersions>,
    ) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id,
            ts: Utc::now(),
            channel_values,
            channel_versions,
            versions_seen,
            pending_sends: Vec::new(),
            updated_channels: None,
        }
    }

    /// An empty checkpoint with a fresh id.
    ///
    /// Ids are UUIDv7: time-ordered, so lexicographic comparison within a
    /// thread matches creation order.
    pub fn empty() -> Self {
        Self::new(
            Uuid::now_v7().to_string(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        )
    }

    pub fn with_pending_sends(mut self, sends: Vec<serde_json::Value>) -> Self {
        self.pending_sends = sends;
        self
    }

    pub fn with_updated_channels(mut self, channels: Vec<String>) -> Self {
        self.updated_channels = Some(channels);
        self
    }

    /// Highest version across all channels, or `None` for a fresh thread.
    pub fn max_channel_version(&self) -> Option<ChannelVersion> {
        self.channel_versions.values().fold(None, |max, v| match max {
            None => Some(v.clone()),
            Some(m) => {
                if v.partial_cmp(&m) == Some(Ordering::Greater) {
                    Some(v.clone())
                } else {
                    Some(m)
                }
            }
        })
    }
}

/// Identifies a checkpoint (or a position in a thread's history).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointConfig {
    /// Thread id. Each thread has an independent checkpoint history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Specific checkpoint to address; latest for the thread if absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,

    /// Checkpoint namespace. Empty/absent for the root graph; subgraphs run
    /// under `parent_ns|node` namespaces (see [`child_namespace`]).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_ns: Option<String>,

    /// Additional configuration.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_id(mut self, thread_id: String) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: CheckpointId) -> Self {
        self.checkpoint_id = Some(checkpoint_id);
        self
    }

    pub fn with_checkpoint_ns(mut self, checkpoint_ns: String) -> Self {
        self.checkpoint_ns = Some(checkpoint_ns);
        self
    }

    /// The namespace, defaulting to the root namespace.
    pub fn namespace(&self) -> &str {
        self.checkpoint_ns.as_deref().unwrap_or("")
    }
}

/// A checkpoint together with everything a saver knows about it.
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    /// Config addressing this exact checkpoint.
    pub config: CheckpointConfig,

    pub checkpoint: Checkpoint,

    pub metadata: CheckpointMetadata,

    /// Config of the previous checkpoint in the chain, if any.
    pub parent_config: Option<CheckpointConfig>,

    /// Writes from tasks that completed after this checkpoint was taken but
    /// before the next barrier. Present when resuming an interrupted step.
    pub pending_writes: Option<Vec<PendingWrite>>,
}

impl CheckpointTuple {
    pub fn new(
        config: CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self {
            config,
            checkpoint,
            metadata,
            parent_config: None,
            pending_writes: None,
        }
    }

    pub fn with_parent_config(mut self, parent_config: CheckpointConfig) -> Self {
        self.parent_config = Some(parent_config);
        self
    }

    pub fn with_pending_writes(mut self, writes: Vec<PendingWrite>) -> Self {
        self.pending_writes = Some(writes);
        self
    }
}
