//! Streaming execution events.

use crate::interrupt::Interrupt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which events a streamed run emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Full output view after each superstep barrier.
    Values,
    /// Per-task writes as each superstep commits.
    Updates,
}

/// One event from a streamed run.
///
/// The stream is finite: it ends after the final values (or an interrupt or
/// error event).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Output view after a barrier (mode `Values`).
    Values { values: Value },
    /// One task's writes at a barrier (mode `Updates`).
    Updates { node: String, update: Value },
    /// The run paused; resume with a value to continue.
    Interrupted { interrupts: Vec<Interrupt> },
    /// The run failed.
    Error { message: String },
}
