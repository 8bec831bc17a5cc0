//! Per-run configuration.

use crate::command::ResumeValue;
use crate::stream::StreamMode;
use tokio::sync::watch;
use weft_checkpoint::CheckpointConfig;

/// Default superstep budget per run.
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Configuration for a single invocation.
///
/// `thread_id` names the checkpoint history the run reads and extends;
/// without one (and without a checkpointer) the run is stateless.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub thread_id: Option<String>,

    /// Checkpoint namespace. Root runs leave this empty; subgraph runs get
    /// a derived namespace.
    pub checkpoint_ns: String,

    /// Resume or fork from this checkpoint instead of the latest.
    pub checkpoint_id: Option<String>,

    /// Maximum supersteps before the run fails with `RecursionLimit`.
    pub recursion_limit: usize,

    /// Resume value(s) for a paused run.
    pub resume: Option<ResumeValue>,

    /// Which event kinds `stream()` emits.
    pub stream_modes: Vec<StreamMode>,

    /// Cooperative cancellation: flip the watched value to `true` to stop
    /// the run before its next superstep commits.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            thread_id: None,
            checkpoint_ns: String::new(),
            checkpoint_id: None,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            resume: None,
            stream_modes: vec![StreamMode::Values],
            cancel: None,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_checkpoint_ns(mut self, ns: impl Into<String>) -> Self {
        self.checkpoint_ns = ns.into();
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_resume(mut self, resume: ResumeValue) -> Self {
        self.resume = Some(resume);
        self
    }

    pub fn with_stream_modes(mut self, modes: Vec<StreamMode>) -> Self {
        self.stream_modes = modes;
        self
    }

    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The checkpoint address this run starts from.
    pub fn checkpoint_config(&self) -> CheckpointConfig {
        let mut config = CheckpointConfig::new().with_checkpoint_ns(self.checkpoint_ns.clone());
        if let Some(thread_id) = &self.thread_id {
            config = config.with_thread_id(thread_id.clone());
        }
        if let Some(checkpoint_id) = &self.checkpoint_id {
            config = config.with_checkpoint_id(checkpoint_id.clone());
        }
        config
    }
}
