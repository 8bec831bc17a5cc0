//! The compiled graph and its run API.
//!
//! An [`Engine`] is immutable and cheap to clone; every invocation builds
//! fresh channels, restores them from the thread's checkpoint if one
//! exists, and drives the superstep loop. Concurrent runs on different
//! threads share nothing but the checkpointer and store.

use crate::command::{Command, CommandGraph, GotoTarget, ResumeValue};
use crate::config::RunConfig;
use crate::error::{GraphError, Result};
use crate::graph::{ChannelType, GraphBuilder, NodeSpec, INPUT, INTERRUPT};
use crate::interrupt::Interrupt;
use crate::node::{NodeContext, NodeExecutor, NodeFuture, NodeOutput};
use crate::pregel::algo::prepare_next_tasks;
use crate::pregel::io::map_output;
use crate::pregel::loop_impl::{PregelLoop, RunOutcome};
use crate::pregel::types::{PathSegment, TaskWrites};
use crate::store::Store;
use crate::stream::StreamEvent;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;
use weft_checkpoint::{
    child_namespace, Channel, CheckpointConfig, CheckpointMetadata, CheckpointSaver,
    CheckpointSource, CheckpointTuple, EphemeralValueChannel,
};

/// A thread's state at one checkpoint, as seen from outside.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    /// Output view of the channels at this checkpoint.
    pub values: Value,
    /// Nodes that would run in the next superstep. Empty means quiesced.
    pub next: Vec<String>,
    /// Config addressing this exact checkpoint.
    pub config: CheckpointConfig,
    pub metadata: Option<CheckpointMetadata>,
    pub parent_config: Option<CheckpointConfig>,
    pub created_at: DateTime<Utc>,
    /// Interrupts pending on this checkpoint.
    pub interrupts: Vec<Interrupt>,
}

/// A compiled, executable graph.
#[derive(Clone)]
pub struct Engine {
    nodes: HashMap<String, NodeSpec>,
    channel_specs: HashMap<String, ChannelType>,
    signal_channels: HashSet<String>,
    trigger_to_nodes: HashMap<String, Vec<String>>,
    output_channels: Vec<String>,
    checkpointer: Option<Arc<dyn CheckpointSaver>>,
    store: Option<Arc<dyn Store>>,
    interrupt_before: HashSet<String>,
    interrupt_after: HashSet<String>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        nodes: HashMap<String, NodeSpec>,
        channel_specs: HashMap<String, ChannelType>,
        signal_channels: HashSet<String>,
        trigger_to_nodes: HashMap<String, Vec<String>>,
        output_channels: Vec<String>,
        checkpointer: Option<Arc<dyn CheckpointSaver>>,
        store: Option<Arc<dyn Store>>,
        interrupt_before: HashSet<String>,
        interrupt_after: HashSet<String>,
    ) -> Self {
        Self {
            nodes,
            channel_specs,
            signal_channels,
            trigger_to_nodes,
            output_channels,
            checkpointer,
            store,
            interrupt_before,
            interrupt_after,
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    pub(crate) fn nodes(&self) -> &HashMap<String, NodeSpec> {
        &self.nodes
    }

    pub(crate) fn trigger_to_nodes(&self) -> &HashMap<String, Vec<String>> {
        &self.trigger_to_nodes
    }

    pub(crate) fn output_channels(&self) -> &[String] {
        &self.output_channels
    }

    pub(crate) fn interrupt_before(&self) -> &HashSet<String> {
        &self.interrupt_before
    }

    pub(crate) fn interrupt_after(&self) -> &HashSet<String> {
        &self.interrupt_after
    }

    pub(crate) fn checkpointer(&self) -> Option<Arc<dyn CheckpointSaver>> {
        self.checkpointer.clone()
    }

    pub(crate) fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.clone()
    }

    /// Names of the user-declared state channels.
    pub(crate) fn declared_channels(&self) -> HashSet<String> {
        self.channel_specs.keys().cloned().collect()
    }

    /// Fresh, empty channel instances for one run: the declared channels,
    /// the input trigger, and one signal channel per static-edge source.
    pub(crate) fn build_channels(&self) -> HashMap<String, Box<dyn Channel>> {
        let mut channels: HashMap<String, Box<dyn Channel>> = self
            .channel_specs
            .iter()
            .map(|(name, spec)| (name.clone(), spec.build()))
            .collect();
        channels.insert(
            INPUT.to_string(),
            Box::new(EphemeralValueChannel::new()) as Box<dyn Channel>,
        );
        for name in &self.signal_channels {
            channels.insert(
                name.clone(),
                Box::new(EphemeralValueChannel::new()) as Box<dyn Channel>,
            );
        }
        channels
    }

    pub(crate) async fn run(
        &self,
        input: Option<Value>,
        config: RunConfig,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<RunOutcome> {
        let pregel_loop = PregelLoop::initialize(self, &config, input, events).await?;
        pregel_loop.run().await
    }

    /// Run to completion (or interrupt) and return the final output view.
    ///
    /// `None` input continues the thread from its checkpoint. When the run
    /// pauses, the returned value carries the pending interrupts under the
    /// `"__interrupt__"` key; resume with [`Engine::resume`].
    pub async fn invoke(
        &self,
        input: impl Into<Option<Value>>,
        config: RunConfig,
    ) -> Result<Value> {
        let outcome = self.run(input.into(), config, None).await?;
        Ok(outcome.values)
    }

    /// Resume a paused thread with a value for its pending interrupt(s).
    pub async fn resume(&self, resume: ResumeValue, mut config: RunConfig) -> Result<Value> {
        config.resume = Some(resume);
        let outcome = self.run(None, config, None).await?;
        Ok(outcome.values)
    }

    /// Run while streaming events per the config's stream modes.
    ///
    /// The stream is finite; a failing run ends it with one
    /// [`StreamEvent::Error`].
    pub fn stream(
        &self,
        input: impl Into<Option<Value>>,
        config: RunConfig,
    ) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let engine = self.clone();
        let input = input.into();
        tokio::spawn(async move {
            if let Err(err) = engine.run(input, config, Some(tx.clone())).await {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
            }
        });
        ReceiverStream::new(rx)
    }

    /// The thread's current state (or the state at `config.checkpoint_id`).
    pub async fn get_state(&self, config: &RunConfig) -> Result<Option<StateSnapshot>> {
        let saver = self.require_checkpointer()?;
        match saver.get_tuple(&config.checkpoint_config()).await? {
            Some(tuple) => Ok(Some(self.snapshot_from(tuple)?)),
            None => Ok(None),
        }
    }

    /// The thread's checkpoint history, newest first.
    pub async fn get_state_history(
        &self,
        config: &RunConfig,
        limit: Option<usize>,
    ) -> Result<Vec<StateSnapshot>> {
        let saver = self.require_checkpointer()?;
        let mut address = config.checkpoint_config();
        address.checkpoint_id = None;
        let mut stream = saver.list(Some(&address), None, None, limit).await?;

        let mut snapshots = Vec::new();
        while let Some(tuple) = stream.next().await {
            snapshots.push(self.snapshot_from(tuple?)?);
        }
        Ok(snapshots)
    }

    /// Overwrite channels at the thread's head (or at `checkpoint_id`,
    /// forking history) and persist a new checkpoint.
    ///
    /// `as_node` attributes the update to a node: its static-edge
    /// successors will run next, as if the node itself had written this.
    pub async fn update_state(
        &self,
        config: &RunConfig,
        values: Value,
        as_node: Option<&str>,
    ) -> Result<CheckpointConfig> {
        let saver = self.require_checkpointer()?;
        let tuple = saver
            .get_tuple(&config.checkpoint_config())
            .await?
            .ok_or_else(|| {
                GraphError::Validation("no checkpoint to update for this thread".to_string())
            })?;

        let declared = self.declared_channels();
        let writes: Vec<(String, Value)> = match values {
            Value::Object(map) if map.keys().all(|k| declared.contains(k)) => {
                map.into_iter().collect()
            }
            other => {
                return Err(GraphError::InvalidUpdate(format!(
                    "state update must be an object of declared channels, got {other}"
                )))
            }
        };

        let mut channels = self.build_channels();
        for (name, value) in &tuple.checkpoint.channel_values {
            if let Some(channel) = channels.get_mut(name) {
                channel.from_checkpoint(value.clone())?;
            }
        }
        let mut checkpoint = tuple.checkpoint.clone();

        let mut all_writes = writes;
        let name = match as_node {
            Some(node) => {
                if !self.nodes.contains_key(node) {
                    return Err(GraphError::Validation(format!(
                        "as_node '{node}' is not a node"
                    )));
                }
                if self.signal_channels.contains(node) {
                    // Wake the node's static-edge successors.
                    all_writes.push((node.to_string(), Value::Bool(true)));
                }
                node.to_string()
            }
            None => "__update__".to_string(),
        };
        crate::pregel::algo::apply_writes(
            &mut checkpoint,
            &mut channels,
            vec![TaskWrites {
                path: vec![PathSegment::String("__update__".to_string())],
                name,
                writes: all_writes,
                triggers: Vec::new(),
            }],
            &self.trigger_to_nodes,
        )?;

        checkpoint.id = Uuid::now_v7().to_string();
        checkpoint.ts = Utc::now();
        checkpoint.channel_values = channels
            .iter()
            .filter(|(_, c)| c.is_available())
            .filter_map(|(name, c)| c.checkpoint().ok().map(|v| (name.clone(), v)))
            .collect();

        let step = tuple.metadata.step.unwrap_or(-1) + 1;
        let mut parents = HashMap::new();
        parents.insert(
            tuple.config.namespace().to_string(),
            tuple.checkpoint.id.clone(),
        );
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Update)
            .with_step(step)
            .with_parents(parents);

        let versions = checkpoint.channel_versions.clone();
        Ok(saver.put(&tuple.config, checkpoint, metadata, versions).await?)
    }

    fn require_checkpointer(&self) -> Result<&Arc<dyn CheckpointSaver>> {
        self.checkpointer.as_ref().ok_or_else(|| {
            GraphError::Validation("this operation requires a checkpointer".to_string())
        })
    }

    fn snapshot_from(&self, tuple: CheckpointTuple) -> Result<StateSnapshot> {
        let mut channels = self.build_channels();
        for (name, value) in &tuple.checkpoint.channel_values {
            if let Some(channel) = channels.get_mut(name) {
                channel.from_checkpoint(value.clone())?;
            }
        }

        let tasks = prepare_next_tasks(
            &tuple.checkpoint,
            &self.nodes,
            &channels,
            &self.trigger_to_nodes,
            tuple.config.namespace(),
        )?;
        let mut next: Vec<String> = tasks.values().map(|t| t.name.clone()).collect();
        next.sort();
        next.dedup();

        let interrupts: Vec<Interrupt> = tuple
            .pending_writes
            .iter()
            .flatten()
            .filter(|(_, channel, _)| channel == INTERRUPT)
            .flat_map(|(_, _, value)| crate::pregel::loop_impl::parse_interrupt_marker(value))
            .collect();

        Ok(StateSnapshot {
            values: map_output(&channels, &self.output_channels),
            next,
            config: tuple.config,
            metadata: Some(tuple.metadata),
            parent_config: tuple.parent_config,
            created_at: tuple.checkpoint.ts,
            interrupts,
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.nodes.keys().collect();
        names.sort();
        f.debug_struct("Engine")
            .field("nodes", &names)
            .field("channels", &self.channel_specs)
            .field("output_channels", &self.output_channels)
            .finish()
    }
}

impl GraphBuilder {
    /// Attach a compiled graph as a node.
    ///
    /// The child runs under a derived checkpoint namespace
    /// (`parent_ns|name`), so its history nests inside the parent thread's.
    /// Child interrupts propagate up; a resume value supplied to the parent
    /// is forwarded down. Commands the child's nodes address to their
    /// parent graph are applied here.
    pub fn subgraph(self, name: impl Into<String>, engine: Engine) -> Self {
        let name = name.into();
        self.add_node(NodeSpec::new(
            name.clone(),
            Arc::new(SubgraphNode { name, engine }),
        ))
    }
}

/// Node wrapper that runs a nested engine.
struct SubgraphNode {
    name: String,
    engine: Engine,
}

impl NodeExecutor for SubgraphNode {
    fn execute(&self, input: Value, ctx: NodeContext) -> NodeFuture<'_> {
        Box::pin(async move {
            let mut config = RunConfig::new()
                .with_checkpoint_ns(child_namespace(ctx.namespace(), ctx.node()));
            if let Some(thread_id) = ctx.thread_id() {
                config = config.with_thread_id(thread_id);
            }

            // On resume, the child picks up from its own checkpoint; seeding
            // the input again would restart it.
            let (child_input, resume) = match ctx.resume_value() {
                Some(value) => (None, Some(ResumeValue::Single(value.clone()))),
                None => (Some(input), None),
            };
            config.resume = resume;

            let outcome = self.engine.run(child_input, config, None).await?;
            if let Some(gi) = outcome.interrupt {
                return Err(GraphError::Interrupted(gi));
            }

            if outcome.parent_commands.is_empty() {
                return Ok(NodeOutput::Update(outcome.values));
            }

            // Commands addressed to this level apply here; anything aimed
            // higher keeps propagating.
            let mut here: Vec<Command> = Vec::new();
            let mut higher: Vec<Command> = Vec::new();
            for mut command in outcome.parent_commands {
                match &command.graph {
                    Some(CommandGraph::Named(n)) if n != &self.name => higher.push(command),
                    _ => {
                        command.graph = Some(CommandGraph::Current);
                        here.push(command);
                    }
                }
            }
            if let Some(command) = higher.into_iter().next() {
                if !here.is_empty() {
                    tracing::warn!(
                        subgraph = %self.name,
                        "dropping locally-addressed commands in favor of one aimed higher"
                    );
                }
                return Ok(NodeOutput::Command(command));
            }
            if here.len() == 1 {
                let mut commands = here;
                return Ok(NodeOutput::Command(commands.remove(0)));
            }

            let mut update = serde_json::Map::new();
            let mut sends = Vec::new();
            for command in here {
                if let Some(Value::Object(map)) = command.update {
                    update.extend(map);
                }
                if let Some(goto) = command.goto {
                    sends.extend(goto.into_sends());
                }
            }
            let mut merged = Command::new().with_graph(CommandGraph::Current);
            if !update.is_empty() {
                merged.update = Some(Value::Object(update));
            }
            if !sends.is_empty() {
                merged.goto = Some(GotoTarget::Sends(sends));
            }
            Ok(NodeOutput::Command(merged))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::START;
    use crate::node::node_fn;
    use serde_json::json;

    #[tokio::test]
    async fn stateless_invoke_runs_to_quiescence() {
        let engine = GraphBuilder::new()
            .channel("n", ChannelType::LastValue)
            .add_node(NodeSpec::new(
                "double",
                node_fn(|input: Value, _ctx| async move {
                    let n = input["n"].as_i64().unwrap_or(0);
                    Ok(NodeOutput::update(json!({"n": n * 2})))
                }),
            ))
            .edge(START, "double")
            .compile()
            .unwrap();

        let out = engine
            .invoke(json!({"n": 21}), RunConfig::new())
            .await
            .unwrap();
        assert_eq!(out, json!(42));
    }

    #[tokio::test]
    async fn state_inspection_requires_checkpointer() {
        let engine = GraphBuilder::new()
            .channel("n", ChannelType::LastValue)
            .node("noop", node_fn(|_, _| async { Ok(NodeOutput::empty()) }))
            .compile()
            .unwrap();

        let err = engine.get_state(&RunConfig::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }
}
