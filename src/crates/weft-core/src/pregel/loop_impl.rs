//! The superstep execution loop.
//!
//! One [`PregelLoop`] drives one run of a graph:
//!
//! ```text
//!  initialize ──► restore checkpoint (or seed input)
//!      │
//!      ▼
//!  ┌─► prepare_next_tasks ──── none due ──► DONE (final values)
//!  │        │
//!  │        ▼
//!  │   execute tasks concurrently      ◄── recorded writes replayed,
//!  │        │                              not re-executed
//!  │        ├── interrupt raised ──► record markers, pause ──► INTERRUPTED
//!  │        ├── fatal error ──► commit surviving writes ──► ERRORED
//!  │        ▼
//!  └── apply_writes barrier + checkpoint put()
//! ```
//!
//! Tasks within a superstep run concurrently against the same snapshot;
//! nothing any of them writes is visible until the barrier commits all of
//! it. A run is therefore always resumable from its last checkpoint: either
//! a barrier committed (and the checkpoint names it) or it did not (and the
//! previous checkpoint plus recorded per-task writes reproduce the step).

use crate::command::Command;
use crate::config::RunConfig;
use crate::engine::Engine;
use crate::error::{GraphError, Result};
use crate::graph::{NodeSpec, INPUT, INTERRUPT, SCRATCHPAD, TASKS};
use crate::interrupt::{GraphInterrupt, Interrupt};
use crate::node::{NodeContext, NodeOutput};
use crate::pregel::algo::{apply_writes, prepare_next_tasks};
use crate::pregel::executor::TaskExecutor;
use crate::pregel::io::{map_input, map_output};
use crate::pregel::types::{PathSegment, PregelExecutableTask, TaskEffects, TaskWrites};
use crate::send::Send as SendMsg;
use crate::store::Store;
use crate::stream::{StreamEvent, StreamMode};
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;
use weft_checkpoint::{
    Channel, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
};

/// How a run ended.
#[derive(Debug)]
pub struct RunOutcome {
    /// Final output view. When the run paused, this carries the pending
    /// interrupts under the `"__interrupt__"` key.
    pub values: Value,

    /// Present when the run paused rather than finished.
    pub interrupt: Option<GraphInterrupt>,

    /// Commands produced by nodes that target an enclosing graph. Empty for
    /// root runs; a subgraph wrapper forwards these upward.
    pub parent_commands: Vec<Command>,
}

enum StepOutcome {
    Continue,
    Paused(GraphInterrupt),
}

pub(crate) struct PregelLoop {
    nodes: HashMap<String, NodeSpec>,
    channels: HashMap<String, Box<dyn Channel>>,
    declared: HashSet<String>,
    trigger_to_nodes: HashMap<String, Vec<String>>,
    output_channels: Vec<String>,
    interrupt_before: HashSet<String>,
    interrupt_after: HashSet<String>,

    checkpointer: Option<Arc<dyn CheckpointSaver>>,
    store: Option<Arc<dyn Store>>,

    checkpoint: Checkpoint,
    /// Addresses the checkpoint the next `put_writes` attaches to (and the
    /// parent of the next `put`).
    checkpoint_config: CheckpointConfig,
    ns: String,
    thread_id: Option<String>,

    /// Step number for checkpoint metadata: -1 input seed, then 0, 1, ...
    step: i32,
    /// Supersteps executed by this run, against the recursion limit.
    supersteps: usize,
    recursion_limit: usize,

    /// task id -> resume value for re-executed interrupted tasks.
    resume_map: HashMap<String, Value>,
    /// True on the first superstep of a resumed run; static breakpoints are
    /// skipped once so the run can move past them.
    resuming: bool,
    /// task id -> writes recorded before an interrupt; replayed, not re-run.
    recorded_writes: HashMap<String, Vec<(String, Value)>>,
    /// Tasks that already carry an interrupt marker on this checkpoint.
    interrupted_tasks: HashSet<String>,
    /// interrupt id -> task id that raised it. The two differ when a
    /// subgraph surfaces its child's interrupts.
    interrupt_alias: HashMap<String, String>,

    cancel: Option<watch::Receiver<bool>>,
    events: Option<mpsc::Sender<StreamEvent>>,
    stream_modes: Vec<StreamMode>,
    parent_commands: Vec<Command>,
}

impl PregelLoop {
    /// Build a loop for one run: restore the thread's checkpoint if there is
    /// one, seed the input if given.
    pub(crate) async fn initialize(
        engine: &Engine,
        config: &RunConfig,
        input: Option<Value>,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<Self> {
        let mut this = Self {
            nodes: engine.nodes().clone(),
            channels: engine.build_channels(),
            declared: engine.declared_channels(),
            trigger_to_nodes: engine.trigger_to_nodes().clone(),
            output_channels: engine.output_channels().to_vec(),
            interrupt_before: engine.interrupt_before().clone(),
            interrupt_after: engine.interrupt_after().clone(),
            checkpointer: engine.checkpointer(),
            store: engine.store(),
            checkpoint: Checkpoint::empty(),
            checkpoint_config: config.checkpoint_config(),
            ns: config.checkpoint_ns.clone(),
            thread_id: config.thread_id.clone(),
            step: -1,
            supersteps: 0,
            recursion_limit: config.recursion_limit,
            resume_map: HashMap::new(),
            resuming: false,
            recorded_writes: HashMap::new(),
            interrupted_tasks: HashSet::new(),
            interrupt_alias: HashMap::new(),
            cancel: config.cancel.clone(),
            events,
            stream_modes: config.stream_modes.clone(),
            parent_commands: Vec::new(),
        };
        let mut restored = false;
        if let (Some(saver), Some(_)) = (&this.checkpointer, &config.thread_id) {
            if let Some(tuple) = saver.get_tuple(&config.checkpoint_config()).await? {
                this.restore(tuple)?;
                restored = true;
            } else if config.checkpoint_id.is_some() {
                return Err(GraphError::Checkpoint(
                    weft_checkpoint::CheckpointError::NotFound(
                        config.checkpoint_id.clone().unwrap_or_default(),
                    ),
                ));
            }
        }

        if let Some(resume) = &config.resume {
            if !restored {
                return Err(GraphError::Validation(
                    "cannot resume: no checkpoint for this thread".to_string(),
                ));
            }
            this.resuming = true;
            match resume {
                crate::command::ResumeValue::Single(value) => {
                    for task_id in &this.interrupted_tasks {
                        this.resume_map.insert(task_id.clone(), value.clone());
                    }
                }
                crate::command::ResumeValue::ByInterruptId(map) => {
                    for (interrupt_id, value) in map {
                        let task_id = this
                            .interrupt_alias
                            .get(interrupt_id)
                            .cloned()
                            .unwrap_or_else(|| interrupt_id.clone());
                        this.resume_map.insert(task_id, value.clone());
                    }
                }
            }
        }

        match input {
            Some(input) => {
                tracing::debug!(ns = %this.ns, "seeding run input");
                let writes = map_input(input, &this.declared);
                let seed = TaskWrites {
                    path: vec![PathSegment::String(INPUT.to_string())],
                    name: INPUT.to_string(),
                    writes,
                    triggers: Vec::new(),
                };
                this.commit(vec![seed], Vec::new(), CheckpointSource::Input)
                    .await?;
            }
            None if !restored => {
                return Err(GraphError::Validation(
                    "no input and no checkpoint to resume from".to_string(),
                ));
            }
            None => {}
        }

        Ok(this)
    }

    fn restore(&mut self, tuple: weft_checkpoint::CheckpointTuple) -> Result<()> {
        for (name, value) in &tuple.checkpoint.channel_values {
            if let Some(channel) = self.channels.get_mut(name) {
                channel.from_checkpoint(value.clone())?;
            }
        }
        self.step = tuple.metadata.step.unwrap_or(-1) + 1;
        self.checkpoint = tuple.checkpoint;
        self.checkpoint_config = tuple.config;

        for (task_id, channel, value) in tuple.pending_writes.unwrap_or_default() {
            if channel == INTERRUPT {
                for interrupt in parse_interrupt_marker(&value) {
                    self.interrupt_alias.insert(interrupt.id, task_id.clone());
                }
                self.interrupted_tasks.insert(task_id);
            } else {
                self.recorded_writes
                    .entry(task_id)
                    .or_default()
                    .push((channel, value));
            }
        }
        Ok(())
    }

    /// Drive the run to completion, an interrupt, or an error.
    pub(crate) async fn run(mut self) -> Result<RunOutcome> {
        loop {
            let tasks = prepare_next_tasks(
                &self.checkpoint,
                &self.nodes,
                &self.channels,
                &self.trigger_to_nodes,
                &self.ns,
            )?;

            if tasks.is_empty() {
                let values = self.output();
                if self.stream_modes.contains(&StreamMode::Values) {
                    self.emit(StreamEvent::Values {
                        values: values.clone(),
                    })
                    .await;
                }
                tracing::info!(ns = %self.ns, steps = self.supersteps, "run complete");
                return Ok(RunOutcome {
                    values,
                    interrupt: None,
                    parent_commands: std::mem::take(&mut self.parent_commands),
                });
            }

            if self.supersteps >= self.recursion_limit {
                return Err(GraphError::RecursionLimit {
                    limit: self.recursion_limit,
                });
            }

            if !self.resuming {
                let hits: Vec<&PregelExecutableTask> = tasks
                    .values()
                    .filter(|t| self.interrupt_before.contains(&t.name))
                    .collect();
                if !hits.is_empty() {
                    let pending: Vec<(String, Vec<Interrupt>)> = hits
                        .iter()
                        .map(|t| {
                            let interrupt = Interrupt::new(
                                json!({"breakpoint": "before", "node": t.name}),
                                t.id.clone(),
                                self.ns.clone(),
                            );
                            (t.id.clone(), vec![interrupt])
                        })
                        .collect();
                    return self.pause(pending).await;
                }
            }

            match self.execute_superstep(tasks).await? {
                StepOutcome::Continue => {
                    self.resuming = false;
                    self.supersteps += 1;
                }
                StepOutcome::Paused(gi) => {
                    let values = self.output_with_interrupts(&gi);
                    return Ok(RunOutcome {
                        values,
                        interrupt: Some(gi),
                        parent_commands: std::mem::take(&mut self.parent_commands),
                    });
                }
            }
        }
    }

    async fn execute_superstep(
        &mut self,
        tasks: BTreeMap<String, PregelExecutableTask>,
    ) -> Result<StepOutcome> {
        tracing::debug!(
            ns = %self.ns,
            step = self.step,
            tasks = tasks.len(),
            "superstep start"
        );

        // Split replayed tasks (completed before an interrupt) from the
        // ones that actually execute.
        let mut completed: Vec<(PregelExecutableTask, TaskEffects)> = Vec::new();
        let mut to_run: Vec<(PregelExecutableTask, NodeContext)> = Vec::new();
        for (_, task) in tasks {
            if let Some(recorded) = self.recorded_writes.remove(&task.id) {
                let effects = effects_from_recorded(recorded)?;
                completed.push((task, effects));
                continue;
            }
            let ctx = NodeContext::new(&task.id, &task.name, &self.ns)
                .with_thread_id(self.thread_id.clone())
                .with_resume(self.resume_map.get(&task.id).cloned())
                .with_store(self.store.clone());
            to_run.push((task, ctx));
        }

        let futures = to_run
            .iter()
            .map(|(task, ctx)| async move { (task, TaskExecutor::execute(task, ctx.clone()).await) });
        let results: Vec<(&PregelExecutableTask, Result<NodeOutput>)> =
            if let Some(cancel) = self.cancel.as_mut() {
                tokio::select! {
                    _ = async {
                        // Sender gone: cancellation can never fire. The
                        // guard result is dropped before the await so the
                        // future stays Send.
                        if cancel.wait_for(|stop| *stop).await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    } => {
                        tracing::info!(ns = %self.ns, "run cancelled mid-superstep, nothing committed");
                        return Err(GraphError::Cancelled);
                    }
                    results = join_all(futures) => results,
                }
            } else {
                join_all(futures).await
            };

        let mut interrupted: Vec<(String, Vec<Interrupt>)> = Vec::new();
        let mut fatal: Option<GraphError> = None;
        let mut succeeded: Vec<(PregelExecutableTask, TaskEffects)> = Vec::new();
        for (task, result) in results {
            match result {
                Ok(output) => match self.interpret(task, output) {
                    Ok(effects) => {
                        self.record_task_writes(task, &effects).await?;
                        succeeded.push((task.clone(), effects));
                    }
                    Err(err) => fatal = fatal.or(Some(err)),
                },
                Err(GraphError::Interrupted(gi)) => {
                    interrupted.push((task.id.clone(), gi.interrupts));
                }
                Err(err) => fatal = fatal.or(Some(err)),
            }
        }

        if !interrupted.is_empty() {
            // The barrier does not commit. Succeeded siblings were recorded
            // above and will replay when the step resumes.
            if let Some(err) = fatal {
                // A failed sibling outranks the pause; record the markers
                // anyway so the interrupt is still there to resume.
                self.pause(interrupted).await?;
                return Err(err);
            }
            return match self.pause(interrupted).await? {
                RunOutcome {
                    interrupt: Some(gi),
                    ..
                } => Ok(StepOutcome::Paused(gi)),
                _ => Ok(StepOutcome::Continue),
            };
        }

        let executed: Vec<String> = completed
            .iter()
            .chain(&succeeded)
            .map(|(task, _)| task.name.clone())
            .collect();

        // Commit whatever succeeded, even when a sibling failed, so the
        // failure costs one task and not the superstep.
        let mut task_writes = Vec::new();
        let mut sends: Vec<SendMsg> = Vec::new();
        let mut updates: Vec<(String, Value)> = Vec::new();
        for (task, effects) in completed.into_iter().chain(succeeded) {
            let mut writes = effects.writes;
            updates.push((task.name.clone(), writes_as_object(&writes)));
            if self.channels.contains_key(&task.name) && !self.declared.contains(&task.name) {
                // Completion signal for static-edge successors.
                writes.push((task.name.clone(), Value::Bool(true)));
            }
            sends.extend(effects.sends);
            self.parent_commands.extend(effects.parent_commands);
            task_writes.push(TaskWrites {
                path: task.path,
                name: task.name,
                writes,
                triggers: task.triggers,
            });
        }

        self.commit(task_writes, sends, CheckpointSource::Loop).await?;

        if let Some(err) = fatal {
            tracing::error!(ns = %self.ns, step = self.step - 1, error = %err, "superstep failed");
            return Err(err);
        }

        if self.stream_modes.contains(&StreamMode::Updates) {
            for (node, update) in updates {
                self.emit(StreamEvent::Updates { node, update }).await;
            }
        }
        if self.stream_modes.contains(&StreamMode::Values) {
            let values = self.output();
            self.emit(StreamEvent::Values { values }).await;
        }

        // Static after-breakpoints: the barrier committed, pause before the
        // successors run.
        if !self.resuming {
            let hits: Vec<&String> = executed
                .iter()
                .filter(|name| self.interrupt_after.contains(*name))
                .collect();
            if !hits.is_empty() {
                let pending: Vec<(String, Vec<Interrupt>)> = hits
                    .iter()
                    .map(|name| {
                        let id = format!("{}:after:{name}", self.checkpoint.id);
                        let interrupt = Interrupt::new(
                            json!({"breakpoint": "after", "node": name}),
                            id.clone(),
                            self.ns.clone(),
                        );
                        (id, vec![interrupt])
                    })
                    .collect();
                return match self.pause(pending).await? {
                    RunOutcome {
                        interrupt: Some(gi),
                        ..
                    } => Ok(StepOutcome::Paused(gi)),
                    _ => Ok(StepOutcome::Continue),
                };
            }
        }

        Ok(StepOutcome::Continue)
    }

    /// Turn a node's output into channel writes, sends and parent commands.
    fn interpret(&self, task: &PregelExecutableTask, output: NodeOutput) -> Result<TaskEffects> {
        let mut effects = TaskEffects::default();
        match output {
            NodeOutput::Update(value) => {
                effects.writes = self.update_writes(task, value)?;
            }
            NodeOutput::Sends(sends) => effects.sends = sends,
            NodeOutput::Command(command) => {
                if command.targets_parent() {
                    effects.parent_commands.push(command);
                } else {
                    if let Some(update) = command.update {
                        effects.writes = self.update_writes(task, update)?;
                    }
                    if let Some(goto) = command.goto {
                        effects.sends = goto.into_sends();
                    }
                }
            }
        }
        Ok(effects)
    }

    fn update_writes(
        &self,
        task: &PregelExecutableTask,
        value: Value,
    ) -> Result<Vec<(String, Value)>> {
        match value {
            Value::Null => Ok(Vec::new()),
            Value::Object(map) if map.keys().all(|k| self.declared.contains(k)) => {
                for key in map.keys() {
                    if !task.writes_allowed.is_empty() && !task.writes_allowed.contains(key) {
                        return Err(GraphError::InvalidUpdate(format!(
                            "node '{}' may not write channel '{key}'",
                            task.name
                        )));
                    }
                }
                Ok(map.into_iter().collect())
            }
            other => {
                // The bare-value shorthand covers non-object values only;
                // an object that reaches here has undeclared keys and is
                // more likely a typo'd channel name than a payload.
                if let [only] = task.writes_allowed.as_slice() {
                    if !other.is_object() {
                        return Ok(vec![(only.clone(), other)]);
                    }
                }
                Err(GraphError::InvalidUpdate(format!(
                    "node '{}' returned an update that maps to no declared channel",
                    task.name
                )))
            }
        }
    }

    /// Persist one task's effects as pending writes, so a resumed run can
    /// replay them without re-executing the task.
    async fn record_task_writes(
        &self,
        task: &PregelExecutableTask,
        effects: &TaskEffects,
    ) -> Result<()> {
        let Some(saver) = &self.checkpointer else {
            return Ok(());
        };
        let mut writes = effects.writes.clone();
        for send in &effects.sends {
            writes.push((TASKS.to_string(), serde_json::to_value(send)?));
        }
        for command in &effects.parent_commands {
            writes.push((SCRATCHPAD.to_string(), serde_json::to_value(command)?));
        }
        saver
            .put_writes(&self.checkpoint_config, writes, task.id.clone())
            .await?;
        Ok(())
    }

    /// Record interrupt markers, keyed by the task that raised them, and
    /// build the paused outcome. A subgraph task surfaces its child's
    /// interrupts, so the interrupt ids need not match the task id.
    async fn pause(&mut self, pending: Vec<(String, Vec<Interrupt>)>) -> Result<RunOutcome> {
        if let Some(saver) = &self.checkpointer {
            for (task_id, interrupts) in &pending {
                if self.interrupted_tasks.contains(task_id) {
                    continue;
                }
                saver
                    .put_writes(
                        &self.checkpoint_config,
                        vec![(INTERRUPT.to_string(), serde_json::to_value(interrupts)?)],
                        task_id.clone(),
                    )
                    .await?;
            }
        }
        let mut all: Vec<Interrupt> = Vec::new();
        for (task_id, interrupts) in pending {
            for interrupt in &interrupts {
                self.interrupt_alias
                    .insert(interrupt.id.clone(), task_id.clone());
            }
            self.interrupted_tasks.insert(task_id);
            all.extend(interrupts);
        }
        tracing::info!(ns = %self.ns, pending = all.len(), "run paused at interrupt");

        let gi = GraphInterrupt::new(all);
        self.emit(StreamEvent::Interrupted {
            interrupts: gi.interrupts.clone(),
        })
        .await;

        Ok(RunOutcome {
            values: self.output_with_interrupts(&gi),
            interrupt: Some(gi),
            parent_commands: std::mem::take(&mut self.parent_commands),
        })
    }

    /// Apply one superstep's writes and persist the new checkpoint.
    async fn commit(
        &mut self,
        task_writes: Vec<TaskWrites>,
        sends: Vec<SendMsg>,
        source: CheckpointSource,
    ) -> Result<()> {
        apply_writes(
            &mut self.checkpoint,
            &mut self.channels,
            task_writes,
            &self.trigger_to_nodes,
        )?;

        let parent_id = self.checkpoint_config.checkpoint_id.clone();
        self.checkpoint.id = Uuid::now_v7().to_string();
        self.checkpoint.ts = Utc::now();
        self.checkpoint.channel_values = self
            .channels
            .iter()
            .filter(|(_, c)| c.is_available())
            .filter_map(|(name, c)| c.checkpoint().ok().map(|v| (name.clone(), v)))
            .collect();
        self.checkpoint.pending_sends = sends
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()?;

        if let (Some(saver), Some(_)) = (&self.checkpointer, &self.thread_id) {
            let mut metadata = CheckpointMetadata::new()
                .with_source(source)
                .with_step(self.step);
            if let Some(parent_id) = parent_id {
                let mut parents = HashMap::new();
                parents.insert(self.ns.clone(), parent_id);
                metadata = metadata.with_parents(parents);
            }
            self.checkpoint_config = saver
                .put(
                    &self.checkpoint_config,
                    self.checkpoint.clone(),
                    metadata,
                    self.checkpoint.channel_versions.clone(),
                )
                .await?;
        }
        self.step += 1;
        Ok(())
    }

    fn output(&self) -> Value {
        map_output(&self.channels, &self.output_channels)
    }

    fn output_with_interrupts(&self, gi: &GraphInterrupt) -> Value {
        let pending = serde_json::to_value(&gi.interrupts).unwrap_or(Value::Null);
        match self.output() {
            Value::Object(mut map) => {
                map.insert(INTERRUPT.to_string(), pending);
                Value::Object(map)
            }
            other => {
                let mut map = serde_json::Map::new();
                map.insert(INTERRUPT.to_string(), pending);
                map.insert("values".to_string(), other);
                Value::Object(map)
            }
        }
    }

    async fn emit(&self, event: StreamEvent) {
        if let Some(tx) = &self.events {
            // The receiver may have been dropped; streaming is best-effort.
            let _ = tx.send(event).await;
        }
    }
}

/// Decode an interrupt marker's value. Markers store the full interrupt
/// list for one task; a bare object is tolerated for older entries.
pub(crate) fn parse_interrupt_marker(value: &Value) -> Vec<Interrupt> {
    if let Ok(list) = serde_json::from_value::<Vec<Interrupt>>(value.clone()) {
        return list;
    }
    serde_json::from_value::<Interrupt>(value.clone())
        .map(|i| vec![i])
        .unwrap_or_default()
}

fn effects_from_recorded(recorded: Vec<(String, Value)>) -> Result<TaskEffects> {
    let mut effects = TaskEffects::default();
    for (channel, value) in recorded {
        if channel == TASKS {
            effects.sends.push(serde_json::from_value(value)?);
        } else if channel == SCRATCHPAD {
            effects.parent_commands.push(serde_json::from_value(value)?);
        } else {
            effects.writes.push((channel, value));
        }
    }
    Ok(effects)
}

fn writes_as_object(writes: &[(String, Value)]) -> Value {
    let mut map = serde_json::Map::new();
    for (channel, value) in writes {
        map.insert(channel.clone(), value.clone());
    }
    Value::Object(map)
}
