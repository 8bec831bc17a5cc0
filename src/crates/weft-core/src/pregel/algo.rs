//! Superstep scheduling and write application.
//!
//! The two halves of the bulk-synchronous step live here:
//!
//! ```text
//!        prepare_next_tasks                    apply_writes
//!   ┌────────────────────────┐          ┌───────────────────────┐
//!   │ version check per node │  tasks   │ sort writes by path   │
//!   │ + pending sends        ├─────────►│ fold through reducers │
//!   │ input snapshots        │  execute │ bump versions once    │
//!   └────────────────────────┘          └───────────────────────┘
//! ```
//!
//! **Scheduling** is version arithmetic: a node is due when any of its
//! trigger channels has a version strictly greater than the version recorded
//! for that node in `versions_seen`. Sends pending on the checkpoint become
//! push tasks regardless of channel versions.
//!
//! **Write application** happens once per superstep, at the barrier. Tasks
//! never see each other's writes mid-step; every task reads the snapshot
//! taken at scheduling time. At the barrier, writes are ordered by the
//! deterministic task path so that reducers fold them identically on every
//! replay, each written channel's version is bumped exactly once, and
//! untouched channels are notified so ephemeral values expire.

use crate::error::{GraphError, Result};
use crate::graph::NodeSpec;
use crate::pregel::types::{
    task_id, PathSegment, PregelExecutableTask, TaskWrites, PULL, PUSH,
};
use crate::send::Send as SendMsg;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use weft_checkpoint::{Channel, ChannelVersion, Checkpoint};

/// Fold the writes of one superstep into the channels, at the barrier.
///
/// Mutates `checkpoint`'s version bookkeeping in place and returns the set
/// of channels whose version was bumped. Writes to names with no backing
/// channel are an [`GraphError::InvalidUpdate`].
pub fn apply_writes(
    checkpoint: &mut Checkpoint,
    channels: &mut HashMap<String, Box<dyn Channel>>,
    mut tasks: Vec<TaskWrites>,
    trigger_to_nodes: &HashMap<String, Vec<String>>,
) -> Result<HashSet<String>> {
    // Deterministic write order, independent of execution timing. Compared
    // segment-wise so send indices order numerically, not lexically.
    tasks.sort_by(|a, b| a.path.cmp(&b.path));

    // Input seeding carries no triggers and must not expire ephemerals.
    let bump_step = tasks.iter().any(|t| !t.triggers.is_empty());

    for task in &tasks {
        for trigger in &task.triggers {
            if let Some(version) = checkpoint.channel_versions.get(trigger) {
                let version = version.clone();
                checkpoint
                    .versions_seen
                    .entry(task.name.clone())
                    .or_default()
                    .insert(trigger.clone(), version);
            }
        }
    }

    let next_version = checkpoint
        .max_channel_version()
        .map(|v| v.next())
        .unwrap_or(ChannelVersion::Int(1));

    // Group writes per channel, preserving task order within each group.
    let mut grouped: Vec<(String, Vec<Value>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for task in tasks {
        for (channel, value) in task.writes {
            if !channels.contains_key(&channel) {
                return Err(GraphError::InvalidUpdate(format!(
                    "task '{}' wrote to undeclared channel '{channel}'",
                    task.name
                )));
            }
            match index.get(&channel) {
                Some(&i) => grouped[i].1.push(value),
                None => {
                    index.insert(channel.clone(), grouped.len());
                    grouped.push((channel, vec![value]));
                }
            }
        }
    }

    let mut updated: HashSet<String> = HashSet::new();
    for (name, values) in grouped {
        let channel = channels
            .get_mut(&name)
            .ok_or_else(|| GraphError::InvalidUpdate(format!("unknown channel '{name}'")))?;
        if channel
            .update(values)
            .map_err(|e| GraphError::InvalidUpdate(format!("channel '{name}': {e}")))?
        {
            checkpoint
                .channel_versions
                .insert(name.clone(), next_version.clone());
            updated.insert(name);
        }
    }

    if bump_step {
        // Notify untouched channels so single-step values expire. Expiry is
        // silent: a cleared channel keeps its version and re-triggers nobody.
        for (name, channel) in channels.iter_mut() {
            if updated.contains(name) {
                continue;
            }
            if channel.update(vec![])? && channel.is_available() {
                checkpoint
                    .channel_versions
                    .insert(name.clone(), next_version.clone());
                updated.insert(name.clone());
            }
        }

        // If nothing that changed can wake a node, the run is quiescing;
        // give channels their end-of-run notification.
        let any_subscriber = updated
            .iter()
            .any(|name| trigger_to_nodes.contains_key(name));
        if !any_subscriber {
            for (name, channel) in channels.iter_mut() {
                if channel.finish() && channel.is_available() {
                    checkpoint
                        .channel_versions
                        .insert(name.clone(), next_version.clone());
                    updated.insert(name.clone());
                }
            }
        }
    }

    let mut updated_list: Vec<String> = updated.iter().cloned().collect();
    updated_list.sort();
    checkpoint.updated_channels = Some(updated_list);

    Ok(updated)
}

/// Compute the tasks due in the next superstep.
///
/// Pull tasks come from version comparison against `versions_seen`; push
/// tasks from the checkpoint's pending sends, in order. Keyed by task id;
/// ids are deterministic, so preparing twice from the same checkpoint gives
/// the same schedule.
pub fn prepare_next_tasks(
    checkpoint: &Checkpoint,
    nodes: &HashMap<String, NodeSpec>,
    channels: &HashMap<String, Box<dyn Channel>>,
    trigger_to_nodes: &HashMap<String, Vec<String>>,
    ns: &str,
) -> Result<BTreeMap<String, PregelExecutableTask>> {
    let mut tasks = BTreeMap::new();

    // Pull tasks. When the last barrier recorded which channels changed,
    // only their subscribers are candidates; otherwise every node is.
    let mut candidates: Vec<&String> = match &checkpoint.updated_channels {
        Some(updated) => {
            let mut names: Vec<&String> = updated
                .iter()
                .filter_map(|channel| trigger_to_nodes.get(channel))
                .flatten()
                .collect();
            names.sort();
            names.dedup();
            names
        }
        None => {
            let mut names: Vec<&String> = nodes.keys().collect();
            names.sort();
            names
        }
    };
    if checkpoint.channel_versions.is_empty() {
        candidates.clear();
    }

    for name in candidates {
        let Some(spec) = nodes.get(name) else {
            continue;
        };
        let seen = checkpoint.versions_seen.get(name);
        let due = spec.triggers.iter().any(|trigger| {
            let Some(current) = checkpoint.channel_versions.get(trigger) else {
                return false;
            };
            match seen.and_then(|s| s.get(trigger)) {
                Some(last) => current > last,
                None => true,
            }
        });
        if !due {
            continue;
        }

        let identity = trigger_identity(spec, &checkpoint.channel_versions);
        let id = task_id(ns, name, &identity);
        tasks.insert(
            id.clone(),
            PregelExecutableTask {
                id,
                name: name.clone(),
                input: read_input(spec, channels),
                executor: spec.executor.clone(),
                triggers: spec.triggers.clone(),
                writes_allowed: spec.writes.clone(),
                retry_policy: spec.retry_policy.clone(),
                path: vec![
                    PathSegment::String(PULL.to_string()),
                    PathSegment::String(name.clone()),
                ],
            },
        );
    }

    // Push tasks, one per pending send, in send order.
    for (index, send_value) in checkpoint.pending_sends.iter().enumerate() {
        let send: SendMsg = serde_json::from_value(send_value.clone())?;
        let (node, arg) = send.into_parts();
        let spec = nodes.get(&node).ok_or_else(|| {
            GraphError::InvalidUpdate(format!("send targets unknown node '{node}'"))
        })?;

        let input = if arg.is_null() {
            read_input(spec, channels)
        } else {
            arg
        };
        let id = task_id(ns, &node, &format!("{PUSH}@{index}"));
        tasks.insert(
            id.clone(),
            PregelExecutableTask {
                id,
                name: node.clone(),
                input,
                executor: spec.executor.clone(),
                triggers: Vec::new(),
                writes_allowed: spec.writes.clone(),
                retry_policy: spec.retry_policy.clone(),
                path: vec![
                    PathSegment::String(PUSH.to_string()),
                    PathSegment::String(node),
                    PathSegment::Int(index),
                ],
            },
        );
    }

    Ok(tasks)
}

/// Stable description of why a pull task is due: its trigger channels with
/// their current versions.
fn trigger_identity(
    spec: &NodeSpec,
    versions: &weft_checkpoint::ChannelVersions,
) -> String {
    let mut parts: Vec<String> = spec
        .triggers
        .iter()
        .filter_map(|t| versions.get(t).map(|v| format!("{t}@{v}")))
        .collect();
    parts.sort();
    parts.join("+")
}

/// Snapshot a node's input view at scheduling time.
///
/// A single read channel passes its value through bare; several reads
/// compose an object keyed by channel name. Channels without a value are
/// omitted (or `null` for a single read).
fn read_input(spec: &NodeSpec, channels: &HashMap<String, Box<dyn Channel>>) -> Value {
    let reads = if spec.reads.is_empty() {
        &spec.triggers
    } else {
        &spec.reads
    };

    if reads.len() == 1 {
        return channels
            .get(&reads[0])
            .and_then(|c| c.get().ok())
            .unwrap_or(Value::Null);
    }

    let mut view = serde_json::Map::new();
    for name in reads {
        if let Some(value) = channels.get(name).and_then(|c| c.get().ok()) {
            view.insert(name.clone(), value);
        }
    }
    Value::Object(view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ChannelType;
    use crate::node::{node_fn, NodeOutput};
    use serde_json::json;

    fn channel_map(specs: &[(&str, ChannelType)]) -> HashMap<String, Box<dyn Channel>> {
        specs
            .iter()
            .map(|(name, t)| (name.to_string(), t.build()))
            .collect()
    }

    fn spec(name: &str, triggers: &[&str]) -> NodeSpec {
        let mut s = NodeSpec::new(
            name,
            node_fn(|_, _| async { Ok(NodeOutput::empty()) }),
        );
        s.triggers = triggers.iter().map(|t| t.to_string()).collect();
        s
    }

    fn writes(name: &str, writes: Vec<(&str, Value)>, triggers: &[&str]) -> TaskWrites {
        TaskWrites {
            path: vec![
                PathSegment::String(PULL.into()),
                PathSegment::String(name.into()),
            ],
            name: name.to_string(),
            writes: writes
                .into_iter()
                .map(|(c, v)| (c.to_string(), v))
                .collect(),
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn writes_fold_in_path_order() {
        let mut channels = channel_map(&[("log", ChannelType::Topic)]);
        let mut checkpoint = Checkpoint::empty();

        // Handed over out of order; the barrier sorts by path.
        let tasks = vec![
            writes("zeta", vec![("log", json!("z"))], &["log"]),
            writes("alpha", vec![("log", json!("a"))], &["log"]),
        ];
        apply_writes(&mut checkpoint, &mut channels, tasks, &HashMap::new()).unwrap();

        assert_eq!(channels["log"].get().unwrap(), json!(["a", "z"]));
    }

    #[test]
    fn version_bumped_once_per_step() {
        let mut channels = channel_map(&[("total", ChannelType::sum())]);
        let mut checkpoint = Checkpoint::empty();

        let tasks = vec![
            writes("a", vec![("total", json!(1.0))], &[]),
            writes("b", vec![("total", json!(2.0))], &[]),
        ];
        apply_writes(&mut checkpoint, &mut channels, tasks, &HashMap::new()).unwrap();

        assert_eq!(channels["total"].get().unwrap(), json!(3.0));
        assert_eq!(
            checkpoint.channel_versions.get("total"),
            Some(&ChannelVersion::Int(1))
        );
    }

    #[test]
    fn double_digit_send_indices_keep_emission_order() {
        let mut channels = channel_map(&[("state", ChannelType::LastValue)]);
        let mut checkpoint = Checkpoint::empty();

        // Twelve sends to one node, handed over in reverse. Last-write-wins
        // must resolve to emission index 11, not the lexically-largest "9".
        let tasks: Vec<TaskWrites> = (0..12)
            .rev()
            .map(|i| TaskWrites {
                path: vec![
                    PathSegment::String(PUSH.into()),
                    PathSegment::String("worker".into()),
                    PathSegment::Int(i),
                ],
                name: "worker".to_string(),
                writes: vec![("state".to_string(), json!(i))],
                triggers: Vec::new(),
            })
            .collect();
        apply_writes(&mut checkpoint, &mut channels, tasks, &HashMap::new()).unwrap();

        assert_eq!(channels["state"].get().unwrap(), json!(11));
    }

    #[test]
    fn undeclared_channel_write_is_rejected() {
        let mut channels = channel_map(&[("state", ChannelType::LastValue)]);
        let mut checkpoint = Checkpoint::empty();

        let tasks = vec![writes("a", vec![("ghost", json!(1))], &[])];
        let err =
            apply_writes(&mut checkpoint, &mut channels, tasks, &HashMap::new()).unwrap_err();
        assert!(matches!(err, GraphError::InvalidUpdate(_)));
    }

    #[test]
    fn ephemeral_expiry_does_not_retrigger() {
        let mut channels = channel_map(&[
            ("state", ChannelType::LastValue),
            ("__input__", ChannelType::Ephemeral),
        ]);
        let mut checkpoint = Checkpoint::empty();

        // Seed the input (no triggers: not yet a running step).
        let seed = vec![writes("__input__", vec![("__input__", json!("go"))], &[])];
        apply_writes(&mut checkpoint, &mut channels, seed, &HashMap::new()).unwrap();
        let input_version = checkpoint.channel_versions["__input__"].clone();
        assert!(channels["__input__"].is_available());

        // First real barrier: the untouched input expires silently.
        let step = vec![writes("entry", vec![("state", json!(1))], &["__input__"])];
        apply_writes(&mut checkpoint, &mut channels, step, &HashMap::new()).unwrap();
        assert!(!channels["__input__"].is_available());
        assert_eq!(checkpoint.channel_versions["__input__"], input_version);
    }

    #[test]
    fn versions_seen_recorded_for_triggers() {
        let mut channels = channel_map(&[("state", ChannelType::LastValue)]);
        let mut checkpoint = Checkpoint::empty();
        checkpoint
            .channel_versions
            .insert("state".into(), ChannelVersion::Int(4));

        let tasks = vec![writes("reader", vec![], &["state"])];
        apply_writes(&mut checkpoint, &mut channels, tasks, &HashMap::new()).unwrap();

        assert_eq!(
            checkpoint.versions_seen["reader"].get("state"),
            Some(&ChannelVersion::Int(4))
        );
    }

    #[test]
    fn node_triggers_only_on_newer_versions() {
        let channels = channel_map(&[("state", ChannelType::LastValue)]);
        let mut nodes = HashMap::new();
        nodes.insert("reader".to_string(), spec("reader", &["state"]));
        let mut trigger_to_nodes = HashMap::new();
        trigger_to_nodes.insert("state".to_string(), vec!["reader".to_string()]);

        let mut checkpoint = Checkpoint::empty();
        checkpoint
            .channel_versions
            .insert("state".into(), ChannelVersion::Int(2));
        checkpoint.updated_channels = Some(vec!["state".into()]);

        // Unseen version: due.
        let tasks =
            prepare_next_tasks(&checkpoint, &nodes, &channels, &trigger_to_nodes, "").unwrap();
        assert_eq!(tasks.len(), 1);

        // Same version seen: not due.
        checkpoint
            .versions_seen
            .entry("reader".into())
            .or_default()
            .insert("state".into(), ChannelVersion::Int(2));
        let tasks =
            prepare_next_tasks(&checkpoint, &nodes, &channels, &trigger_to_nodes, "").unwrap();
        assert!(tasks.is_empty());

        // Newer version: due again.
        checkpoint
            .channel_versions
            .insert("state".into(), ChannelVersion::Int(3));
        let tasks =
            prepare_next_tasks(&checkpoint, &nodes, &channels, &trigger_to_nodes, "").unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn pending_sends_become_push_tasks_in_order() {
        let channels = channel_map(&[("state", ChannelType::LastValue)]);
        let mut nodes = HashMap::new();
        nodes.insert("worker".to_string(), spec("worker", &[]));

        let mut checkpoint = Checkpoint::empty();
        checkpoint.channel_versions.insert("state".into(), ChannelVersion::Int(1));
        checkpoint.pending_sends = vec![
            serde_json::to_value(SendMsg::new("worker", json!({"shard": 0}))).unwrap(),
            serde_json::to_value(SendMsg::new("worker", json!({"shard": 1}))).unwrap(),
        ];

        let tasks =
            prepare_next_tasks(&checkpoint, &nodes, &channels, &HashMap::new(), "").unwrap();
        assert_eq!(tasks.len(), 2);

        let mut by_index: Vec<_> = tasks.values().collect();
        by_index.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(by_index[0].input, json!({"shard": 0}));
        assert_eq!(by_index[1].input, json!({"shard": 1}));
        assert!(by_index.iter().all(|t| t.triggers.is_empty()));
    }

    #[test]
    fn send_to_unknown_node_errors() {
        let channels = channel_map(&[]);
        let nodes = HashMap::new();

        let mut checkpoint = Checkpoint::empty();
        checkpoint.channel_versions.insert("x".into(), ChannelVersion::Int(1));
        checkpoint.pending_sends =
            vec![serde_json::to_value(SendMsg::to("ghost")).unwrap()];

        let err =
            prepare_next_tasks(&checkpoint, &nodes, &channels, &HashMap::new(), "").unwrap_err();
        assert!(matches!(err, GraphError::InvalidUpdate(_)));
    }

    #[test]
    fn schedule_is_deterministic() {
        let channels = channel_map(&[("state", ChannelType::LastValue)]);
        let mut nodes = HashMap::new();
        nodes.insert("reader".to_string(), spec("reader", &["state"]));
        let mut trigger_to_nodes = HashMap::new();
        trigger_to_nodes.insert("state".to_string(), vec!["reader".to_string()]);

        let mut checkpoint = Checkpoint::empty();
        checkpoint
            .channel_versions
            .insert("state".into(), ChannelVersion::Int(2));
        checkpoint.pending_sends =
            vec![serde_json::to_value(SendMsg::new("reader", json!(1))).unwrap()];

        let first: Vec<String> =
            prepare_next_tasks(&checkpoint, &nodes, &channels, &trigger_to_nodes, "")
                .unwrap()
                .keys()
                .cloned()
                .collect();
        let second: Vec<String> =
            prepare_next_tasks(&checkpoint, &nodes, &channels, &trigger_to_nodes, "")
                .unwrap()
                .keys()
                .cloned()
                .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn multi_read_view_composes_object() {
        let mut channels = channel_map(&[
            ("a", ChannelType::LastValue),
            ("b", ChannelType::LastValue),
        ]);
        channels.get_mut("a").unwrap().update(vec![json!(1)]).unwrap();

        let mut s = spec("reader", &["a"]);
        s.reads = vec!["a".into(), "b".into()];
        // "b" has no value yet and is omitted from the view.
        assert_eq!(read_input(&s, &channels), json!({"a": 1}));

        channels.get_mut("b").unwrap().update(vec![json!(2)]).unwrap();
        assert_eq!(read_input(&s, &channels), json!({"a": 1, "b": 2}));
    }
}
