//! Dynamic task dispatch.
//!
//! A [`Send`] is a message a node returns to schedule another node in the
//! next superstep with an explicit argument, independent of channel versions.
//! Returning several `Send`s to the same node fans out into that many
//! parallel tasks, each with its own payload (the map phase of a map-reduce).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request to run `node` next superstep with `arg` as its input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Send {
    node: String,
    arg: Value,
}

impl Send {
    pub fn new(node: impl Into<String>, arg: Value) -> Self {
        Self {
            node: node.into(),
            arg,
        }
    }

    /// Schedule `node` without a payload; its input is read from its
    /// declared channels instead.
    pub fn to(node: impl Into<String>) -> Self {
        Self::new(node, Value::Null)
    }

    /// The target node name.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// The argument passed as the task's input.
    pub fn arg(&self) -> &Value {
        &self.arg
    }

    pub fn into_parts(self) -> (String, Value) {
        (self.node, self.arg)
    }
}
