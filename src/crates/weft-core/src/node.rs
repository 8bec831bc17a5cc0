//! Node execution contract.
//!
//! A node is an async function from its input view to a [`NodeOutput`]. The
//! scheduler hands each task a [`NodeContext`] carrying its identity, the
//! long-term store, and the interrupt/resume seam.

use crate::command::Command;
use crate::error::{GraphError, Result};
use crate::interrupt::{GraphInterrupt, Interrupt};
use crate::send::Send as SendMsg;
use crate::store::Store;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// What a node returns.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    /// Channel writes as a `{channel: value}` object. A node with exactly
    /// one declared write channel may return a bare value instead.
    Update(Value),
    /// A combined update-and-route directive.
    Command(Command),
    /// Dynamic fan-out: schedule these sends next superstep.
    Sends(Vec<SendMsg>),
}

impl NodeOutput {
    /// Shorthand for a plain channel update.
    pub fn update(value: Value) -> Self {
        NodeOutput::Update(value)
    }

    /// An update that writes nothing.
    pub fn empty() -> Self {
        NodeOutput::Update(Value::Object(serde_json::Map::new()))
    }
}

impl From<Command> for NodeOutput {
    fn from(command: Command) -> Self {
        NodeOutput::Command(command)
    }
}

impl From<Vec<SendMsg>> for NodeOutput {
    fn from(sends: Vec<SendMsg>) -> Self {
        NodeOutput::Sends(sends)
    }
}

/// Per-task execution context.
///
/// Cheap to clone; one is built for every scheduled task.
#[derive(Clone, Default)]
pub struct NodeContext {
    task_id: String,
    node: String,
    ns: String,
    thread_id: Option<String>,
    resume: Option<Value>,
    store: Option<Arc<dyn Store>>,
}

impl NodeContext {
    pub fn new(
        task_id: impl Into<String>,
        node: impl Into<String>,
        ns: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            node: node.into(),
            ns: ns.into(),
            thread_id: None,
            resume: None,
            store: None,
        }
    }

    pub fn with_thread_id(mut self, thread_id: Option<String>) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn with_resume(mut self, resume: Option<Value>) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_store(mut self, store: Option<Arc<dyn Store>>) -> Self {
        self.store = store;
        self
    }

    /// Deterministic id of the running task.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Name of the node this task runs.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Checkpoint namespace of the graph the task runs in.
    pub fn namespace(&self) -> &str {
        &self.ns
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    /// Long-term store shared across threads, if one was attached.
    pub fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.clone()
    }

    /// Resume value supplied for this task, if the run is resuming it.
    pub fn resume_value(&self) -> Option<&Value> {
        self.resume.as_ref()
    }

    /// Pause the run and surface `value` to the caller.
    ///
    /// On first execution this returns the `Interrupted` control signal; the
    /// superstep does not commit and the run pauses at the last checkpoint.
    /// When the run is resumed, the same task executes again and this call
    /// returns the caller's resume value instead.
    pub fn interrupt(&self, value: Value) -> Result<Value> {
        if let Some(resume) = &self.resume {
            return Ok(resume.clone());
        }
        Err(GraphError::Interrupted(GraphInterrupt::single(
            Interrupt::new(value, self.task_id.clone(), self.ns.clone()),
        )))
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("task_id", &self.task_id)
            .field("node", &self.node)
            .field("ns", &self.ns)
            .field("thread_id", &self.thread_id)
            .field("resume", &self.resume)
            .field("store", &self.store.as_ref().map(|_| "<store>"))
            .finish()
    }
}

/// Future returned by a node execution.
pub type NodeFuture<'a> = Pin<Box<dyn Future<Output = Result<NodeOutput>> + Send + 'a>>;

/// The executable body of a node.
pub trait NodeExecutor: Send + Sync {
    fn execute(&self, input: Value, ctx: NodeContext) -> NodeFuture<'_>;
}

struct FnNode<F>(F);

impl<F, Fut> NodeExecutor for FnNode<F>
where
    F: Fn(Value, NodeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutput>> + Send + 'static,
{
    fn execute(&self, input: Value, ctx: NodeContext) -> NodeFuture<'_> {
        Box::pin((self.0)(input, ctx))
    }
}

/// Wrap an async closure as a node executor.
///
/// ```rust,ignore
/// let spec = GraphBuilder::new()
///     .node("double", node_fn(|input, _ctx| async move {
///         let n = input["n"].as_i64().unwrap_or(0);
///         Ok(NodeOutput::update(json!({"n": n * 2})))
///     }));
/// ```
pub fn node_fn<F, Fut>(f: F) -> Arc<dyn NodeExecutor>
where
    F: Fn(Value, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<NodeOutput>> + Send + 'static,
{
    Arc::new(FnNode(f))
}
