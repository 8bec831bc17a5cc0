//! Graph definition and compilation.
//!
//! A graph is a set of named channels (the shared state) plus a set of nodes
//! subscribed to them. [`GraphBuilder`] collects the definition and
//! [`compile`](GraphBuilder::compile)s it into an [`Engine`] after
//! validating names, edges and write permissions.
//!
//! ```text
//!            channels                         nodes
//!  ┌──────────────────────────┐   ┌───────────────────────────┐
//!  │ "messages"  Topic        │   │ "plan"    triggers:[input]│
//!  │ "total"     Reducer(sum) │◄──┤ "work"    triggers:[plan] │
//!  │ "__input__" Ephemeral    │   │ "review"  triggers:[work] │
//!  └──────────────────────────┘   └───────────────────────────┘
//! ```
//!
//! Static edges compile into trigger subscriptions: `edge("plan", "work")`
//! gives `work` a trigger on a hidden signal channel named `"plan"`, which
//! the scheduler writes whenever the `plan` node completes. Dynamic routing
//! (conditional branches, fan-out) is expressed by node return values
//! instead: [`Command`](crate::command::Command) and
//! [`Send`](crate::send::Send).
//!
//! Channel names starting with `__` are reserved for the engine.

use crate::engine::Engine;
use crate::error::{GraphError, Result};
use crate::node::NodeExecutor;
use crate::pregel::RetryPolicy;
use crate::store::Store;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use weft_checkpoint::{
    BinaryOperatorChannel, Channel, CheckpointSaver, EphemeralValueChannel, LastValueChannel,
    ReducerFn, TopicChannel,
};

/// Node identifier type.
pub type NodeId = String;

/// Virtual entry point; `edge(START, node)` marks an entry node.
pub const START: &str = "__start__";
/// Virtual exit point; edges to END are accepted and ignored.
pub const END: &str = "__end__";
/// Ephemeral channel seeded with the run's input; entry nodes trigger on it.
pub const INPUT: &str = "__input__";
/// Pending-write channel name under which sends are recorded mid-superstep.
pub const TASKS: &str = "__pregel_tasks";
/// Pending-write channel name for task errors.
pub const ERROR: &str = "__error__";
/// Pending-write channel name for interrupt markers.
pub const INTERRUPT: &str = "__interrupt__";
/// Channel name for resume values.
pub const RESUME: &str = "__resume__";
/// Reserved for engine-internal task state.
pub const SCRATCHPAD: &str = "__pregel_scratchpad";

/// Names user code may not declare as channels or nodes.
pub const RESERVED: &[&str] = &[
    START, END, INPUT, TASKS, ERROR, INTERRUPT, RESUME, SCRATCHPAD,
];

/// Whether a name is reserved for engine use.
pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name) || name.starts_with("__")
}

/// Declared write-combination behavior of a channel.
#[derive(Clone)]
pub enum ChannelType {
    /// Last write in task order wins.
    LastValue,
    /// Append-only log.
    Topic,
    /// Value lives for exactly one superstep.
    Ephemeral,
    /// Writes folded through an associative reducer.
    Reducer(ReducerFn),
}

impl ChannelType {
    /// A reducer channel from a closure.
    pub fn reducer<F>(f: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        ChannelType::Reducer(Arc::new(f))
    }

    /// Numeric sum reducer channel.
    pub fn sum() -> Self {
        ChannelType::Reducer(weft_checkpoint::sum_reducer())
    }

    /// Array append reducer channel.
    pub fn append() -> Self {
        ChannelType::Reducer(weft_checkpoint::append_reducer())
    }

    /// Instantiate an empty channel of this type.
    pub fn build(&self) -> Box<dyn Channel> {
        match self {
            ChannelType::LastValue => Box::new(LastValueChannel::new()),
            ChannelType::Topic => Box::new(TopicChannel::new()),
            ChannelType::Ephemeral => Box::new(EphemeralValueChannel::new()),
            ChannelType::Reducer(reducer) => {
                Box::new(BinaryOperatorChannel::from_reducer(reducer.clone()))
            }
        }
    }
}

impl std::fmt::Debug for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::LastValue => write!(f, "LastValue"),
            ChannelType::Topic => write!(f, "Topic"),
            ChannelType::Ephemeral => write!(f, "Ephemeral"),
            ChannelType::Reducer(_) => write!(f, "Reducer(<function>)"),
        }
    }
}

/// A node's subscriptions, permissions and body.
#[derive(Clone)]
pub struct NodeSpec {
    pub name: NodeId,
    /// Channels whose version bump schedules this node. Extended by static
    /// edges at compile time.
    pub triggers: Vec<String>,
    /// Channels composing the node's input view. Defaults to `triggers`.
    pub reads: Vec<String>,
    /// Channels the node may write. Empty means any declared channel.
    pub writes: Vec<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub executor: Arc<dyn NodeExecutor>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, executor: Arc<dyn NodeExecutor>) -> Self {
        Self {
            name: name.into(),
            triggers: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            retry_policy: None,
            executor,
        }
    }

    pub fn with_trigger(mut self, channel: impl Into<String>) -> Self {
        self.triggers.push(channel.into());
        self
    }

    pub fn with_reads(mut self, channels: Vec<String>) -> Self {
        self.reads = channels;
        self
    }

    pub fn with_writes(mut self, channels: Vec<String>) -> Self {
        self.writes = channels;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

/// Collects a graph definition and compiles it into an [`Engine`].
#[derive(Default)]
pub struct GraphBuilder {
    channels: HashMap<String, ChannelType>,
    nodes: Vec<NodeSpec>,
    edges: Vec<(String, String)>,
    output_channels: Option<Vec<String>>,
    checkpointer: Option<Arc<dyn CheckpointSaver>>,
    store: Option<Arc<dyn Store>>,
    interrupt_before: HashSet<String>,
    interrupt_after: HashSet<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a state channel.
    pub fn channel(mut self, name: impl Into<String>, channel_type: ChannelType) -> Self {
        self.channels.insert(name.into(), channel_type);
        self
    }

    /// Add a node from its spec.
    pub fn add_node(mut self, spec: NodeSpec) -> Self {
        self.nodes.push(spec);
        self
    }

    /// Add a node with just a name and body; triggers come from edges.
    pub fn node(self, name: impl Into<String>, executor: Arc<dyn NodeExecutor>) -> Self {
        self.add_node(NodeSpec::new(name, executor))
    }

    /// Add a static edge. `START` as source marks an entry node; `END` as
    /// target is accepted and ignored.
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Channels projected into run output. Defaults to all declared channels;
    /// a single output channel yields its bare value.
    pub fn output_channels(mut self, channels: Vec<String>) -> Self {
        self.output_channels = Some(channels);
        self
    }

    pub fn checkpointer(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpointer = Some(saver);
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Pause before these nodes run (static breakpoint).
    pub fn interrupt_before(mut self, nodes: Vec<String>) -> Self {
        self.interrupt_before.extend(nodes);
        self
    }

    /// Pause after these nodes run.
    pub fn interrupt_after(mut self, nodes: Vec<String>) -> Self {
        self.interrupt_after.extend(nodes);
        self
    }

    /// Validate the definition and produce an [`Engine`].
    pub fn compile(self) -> Result<Engine> {
        if self.nodes.is_empty() {
            return Err(GraphError::Validation("graph has no nodes".to_string()));
        }

        let mut nodes: HashMap<String, NodeSpec> = HashMap::new();
        for spec in self.nodes {
            if is_reserved(&spec.name) {
                return Err(GraphError::Validation(format!(
                    "node name '{}' is reserved",
                    spec.name
                )));
            }
            if self.channels.contains_key(&spec.name) {
                return Err(GraphError::Validation(format!(
                    "node '{}' collides with a channel of the same name",
                    spec.name
                )));
            }
            if nodes.insert(spec.name.clone(), spec).is_some() {
                return Err(GraphError::Validation(
                    "duplicate node name".to_string(),
                ));
            }
        }

        for name in self.channels.keys() {
            if is_reserved(name) {
                return Err(GraphError::Validation(format!(
                    "channel name '{name}' is reserved"
                )));
            }
        }

        // Static edges become trigger subscriptions on hidden signal
        // channels named after the source node.
        let mut signal_channels: HashSet<String> = HashSet::new();
        for (from, to) in &self.edges {
            if to == START || from == END {
                return Err(GraphError::Validation(format!(
                    "invalid edge {from} -> {to}"
                )));
            }
            if to == END {
                if from != START && !nodes.contains_key(from) {
                    return Err(GraphError::Validation(format!("unknown node '{from}'")));
                }
                continue;
            }
            let target = nodes.get_mut(to).ok_or_else(|| {
                GraphError::Validation(format!("edge target '{to}' is not a node"))
            })?;
            if from == START {
                target.triggers.push(INPUT.to_string());
            } else {
                target.triggers.push(from.clone());
                signal_channels.insert(from.clone());
            }
        }
        for (from, _) in &self.edges {
            if from != START && !nodes.contains_key(from) {
                return Err(GraphError::Validation(format!(
                    "edge source '{from}' is not a node"
                )));
            }
        }

        let node_names: HashSet<String> = nodes.keys().cloned().collect();
        for spec in nodes.values_mut() {
            spec.triggers.sort();
            spec.triggers.dedup();
            for trigger in &spec.triggers {
                let known = trigger == INPUT
                    || self.channels.contains_key(trigger)
                    || node_names.contains(trigger);
                if !known {
                    return Err(GraphError::Validation(format!(
                        "node '{}' triggers on unknown channel '{trigger}'",
                        spec.name
                    )));
                }
                if node_names.contains(trigger) {
                    signal_channels.insert(trigger.clone());
                }
            }
            for read in &spec.reads {
                if !self.channels.contains_key(read) {
                    return Err(GraphError::Validation(format!(
                        "node '{}' reads unknown channel '{read}'",
                        spec.name
                    )));
                }
            }
            for write in &spec.writes {
                if !self.channels.contains_key(write) {
                    return Err(GraphError::Validation(format!(
                        "node '{}' writes unknown channel '{write}'",
                        spec.name
                    )));
                }
            }
        }

        for name in self.interrupt_before.iter().chain(&self.interrupt_after) {
            if !node_names.contains(name) {
                return Err(GraphError::Validation(format!(
                    "breakpoint on unknown node '{name}'"
                )));
            }
        }

        let output_channels = match self.output_channels {
            Some(channels) => {
                for name in &channels {
                    if !self.channels.contains_key(name) {
                        return Err(GraphError::Validation(format!(
                            "unknown output channel '{name}'"
                        )));
                    }
                }
                channels
            }
            None => {
                let mut all: Vec<String> = self.channels.keys().cloned().collect();
                all.sort();
                all
            }
        };

        let mut trigger_to_nodes: HashMap<String, Vec<String>> = HashMap::new();
        for spec in nodes.values() {
            for trigger in &spec.triggers {
                trigger_to_nodes
                    .entry(trigger.clone())
                    .or_default()
                    .push(spec.name.clone());
            }
        }
        for subscribers in trigger_to_nodes.values_mut() {
            subscribers.sort();
        }

        Ok(Engine::from_parts(
            nodes,
            self.channels,
            signal_channels,
            trigger_to_nodes,
            output_channels,
            self.checkpointer,
            self.store,
            self.interrupt_before,
            self.interrupt_after,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{node_fn, NodeOutput};
    use serde_json::json;

    fn noop() -> Arc<dyn NodeExecutor> {
        node_fn(|_input, _ctx| async move { Ok(NodeOutput::empty()) })
    }

    #[test]
    fn compiles_simple_chain() {
        let engine = GraphBuilder::new()
            .channel("state", ChannelType::LastValue)
            .node("a", noop())
            .node("b", noop())
            .edge(START, "a")
            .edge("a", "b")
            .edge("b", END)
            .compile()
            .unwrap();
        assert_eq!(engine.node("a").unwrap().triggers, vec![INPUT.to_string()]);
        assert_eq!(engine.node("b").unwrap().triggers, vec!["a".to_string()]);
    }

    #[test]
    fn rejects_reserved_names() {
        let err = GraphBuilder::new()
            .channel("__input__", ChannelType::LastValue)
            .node("a", noop())
            .compile()
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));

        let err = GraphBuilder::new()
            .node("__start__", noop())
            .compile()
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn rejects_unknown_edge_target() {
        let err = GraphBuilder::new()
            .node("a", noop())
            .edge("a", "ghost")
            .compile()
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn rejects_node_channel_collision() {
        let err = GraphBuilder::new()
            .channel("a", ChannelType::LastValue)
            .node("a", noop())
            .compile()
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn rejects_undeclared_write_permission() {
        let err = GraphBuilder::new()
            .channel("state", ChannelType::LastValue)
            .add_node(
                NodeSpec::new("a", noop()).with_writes(vec!["ghost".to_string()]),
            )
            .compile()
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn reducer_channel_builds() {
        let channel_type = ChannelType::reducer(|a, b| json!([a, b]));
        let mut channel = channel_type.build();
        channel.update(vec![json!(1), json!(2)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!([1, 2]));
    }
}
