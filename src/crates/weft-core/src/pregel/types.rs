//! Task identity and scheduling types.

use crate::node::NodeExecutor;
use crate::pregel::executor::RetryPolicy;
use crate::send::Send as SendMsg;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Path marker for tasks scheduled by channel subscription.
pub const PULL: &str = "__pull__";
/// Path marker for tasks scheduled by an explicit send.
pub const PUSH: &str = "__push__";

/// UUIDv5 namespace under which task ids are derived.
pub const TASK_NAMESPACE: Uuid = Uuid::from_u128(0x5f8e_a370_3c1f_4a92_b7d4_8e2c_91f0_66aa);

/// Deterministic task id.
///
/// Derived from the graph namespace, the node name and the identity of what
/// scheduled the task: `"channel@version"` for a subscription trigger,
/// `"__push__@index"` for a send. Recomputing the schedule from the same
/// checkpoint therefore yields the same ids, which is what lets a resumed
/// run match previously recorded writes and resume values to their tasks.
pub fn task_id(ns: &str, node: &str, trigger_identity: &str) -> String {
    let name = format!("{ns}|{node}|{trigger_identity}");
    Uuid::new_v5(&TASK_NAMESPACE, name.as_bytes()).to_string()
}

/// One segment of a task path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(untagged)]
pub enum PathSegment {
    String(String),
    Int(usize),
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSegment::String(s) => write!(f, "{s}"),
            PathSegment::Int(i) => write!(f, "{i}"),
        }
    }
}

/// Human-readable rendering of a task path, for logs and diagnostics.
///
/// Ordering uses the structured path itself (segment-wise, so send indices
/// compare numerically), never this string.
pub fn path_key(path: &[PathSegment]) -> String {
    path.iter()
        .map(PathSegment::to_string)
        .collect::<Vec<_>>()
        .join("/")
}

/// A task scheduled for the current superstep, ready to execute.
#[derive(Clone)]
pub struct PregelExecutableTask {
    /// Deterministic id, see [`task_id`].
    pub id: String,
    /// Node this task runs.
    pub name: String,
    /// Snapshot of the node's input view, taken at scheduling time.
    pub input: Value,
    pub executor: Arc<dyn NodeExecutor>,
    /// Trigger channels that scheduled this task; empty for push tasks.
    pub triggers: Vec<String>,
    /// Channels the node may write; empty means any declared channel.
    pub writes_allowed: Vec<String>,
    pub retry_policy: Option<RetryPolicy>,
    /// Position in the schedule, e.g. `[__pull__, node]` or
    /// `[__push__, node, index]`. Write application sorts on this.
    pub path: Vec<PathSegment>,
}

impl std::fmt::Debug for PregelExecutableTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PregelExecutableTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field("path", &self.path)
            .finish()
    }
}

/// The writes one task contributed to a superstep, queued for the barrier.
#[derive(Debug, Clone)]
pub struct TaskWrites {
    pub path: Vec<PathSegment>,
    /// Node name (or a synthetic source like the input seeder).
    pub name: String,
    pub writes: Vec<(String, Value)>,
    /// Trigger channels consumed by the task, recorded into `versions_seen`
    /// at the barrier.
    pub triggers: Vec<String>,
}

/// Everything a task produced: channel writes, sends to schedule next
/// superstep, and commands addressed to an enclosing graph.
#[derive(Debug, Clone, Default)]
pub struct TaskEffects {
    pub writes: Vec<(String, Value)>,
    pub sends: Vec<SendMsg>,
    pub parent_commands: Vec<crate::command::Command>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_deterministic() {
        let a = task_id("", "worker", "state@3");
        let b = task_id("", "worker", "state@3");
        assert_eq!(a, b);

        // Any part of the identity changes the id.
        assert_ne!(a, task_id("", "worker", "state@4"));
        assert_ne!(a, task_id("", "other", "state@3"));
        assert_ne!(a, task_id("outer|work", "worker", "state@3"));
    }

    #[test]
    fn push_and_pull_identities_do_not_collide() {
        let pull = task_id("", "worker", "state@1");
        let push = task_id("", "worker", "__push__@0");
        assert_ne!(pull, push);
    }

    #[test]
    fn structured_paths_compare_send_indices_numerically() {
        let index = |i| {
            vec![
                PathSegment::String(PUSH.into()),
                PathSegment::String("worker".into()),
                PathSegment::Int(i),
            ]
        };
        assert!(index(2) < index(10));
        // The rendered key would say otherwise; it is for logs only.
        assert!(path_key(&index(10)) < path_key(&index(2)));
    }

    #[test]
    fn path_keys_sort_push_after_pull_for_same_node() {
        let pull = path_key(&[
            PathSegment::String(PULL.into()),
            PathSegment::String("worker".into()),
        ]);
        let push = path_key(&[
            PathSegment::String(PUSH.into()),
            PathSegment::String("worker".into()),
            PathSegment::Int(0),
        ]);
        assert_ne!(pull, push);
        assert_eq!(pull, "__pull__/worker");
        assert_eq!(push, "__push__/worker/0");
    }
}
