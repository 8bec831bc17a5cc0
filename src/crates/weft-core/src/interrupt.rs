//! Human-in-the-loop pauses.
//!
//! A node pauses a run by calling [`NodeContext::interrupt`]
//! (crate::node::NodeContext::interrupt) with a payload for the caller. The
//! superstep does not commit: the interrupt is recorded as a pending write
//! against the last checkpoint, the run returns control, and a later
//! invocation with a resume value re-runs the same task, this time receiving
//! the resume value instead of pausing. Tasks that completed alongside the
//! interrupted one are not re-run; their writes were recorded and are
//! replayed at the resumed barrier.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single pending pause, surfaced to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interrupt {
    /// Payload the node handed to `interrupt()` (a question, a draft to
    /// approve, ...).
    pub value: Value,

    /// Stable id, equal to the interrupted task's id. Resume values keyed by
    /// interrupt id address this field.
    pub id: String,

    /// Whether the run can continue past this pause. Static breakpoints set
    /// this too; only a hard abort would not.
    pub resumable: bool,

    /// Checkpoint namespace of the graph that paused. Empty for the root
    /// graph.
    pub ns: String,
}

impl Interrupt {
    pub fn new(value: Value, id: impl Into<String>, ns: impl Into<String>) -> Self {
        Self {
            value,
            id: id.into(),
            resumable: true,
            ns: ns.into(),
        }
    }
}

/// All interrupts raised within one superstep.
///
/// Several parallel tasks can pause in the same step; the caller sees them
/// together and may answer them individually by interrupt id.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GraphInterrupt {
    pub interrupts: Vec<Interrupt>,
}

impl GraphInterrupt {
    pub fn new(interrupts: Vec<Interrupt>) -> Self {
        Self { interrupts }
    }

    pub fn single(interrupt: Interrupt) -> Self {
        Self {
            interrupts: vec![interrupt],
        }
    }

    pub fn first(&self) -> Option<&Interrupt> {
        self.interrupts.first()
    }

    pub fn is_empty(&self) -> bool {
        self.interrupts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn interrupt_defaults_resumable() {
        let interrupt = Interrupt::new(json!({"question": "approve?"}), "task-1", "");
        assert!(interrupt.resumable);
        assert_eq!(interrupt.id, "task-1");
    }

    #[test]
    fn graph_interrupt_collects() {
        let gi = GraphInterrupt::new(vec![
            Interrupt::new(json!(1), "a", ""),
            Interrupt::new(json!(2), "b", "outer|work"),
        ]);
        assert_eq!(gi.first().map(|i| i.id.as_str()), Some("a"));
        assert_eq!(gi.interrupts[1].ns, "outer|work");
    }
}
