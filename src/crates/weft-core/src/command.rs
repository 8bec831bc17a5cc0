//! Combined state-update-and-routing directives.
//!
//! A node can return a [`Command`] instead of a plain update to do both at
//! once: write to channels *and* name what runs next, optionally in a parent
//! graph. Commands are also how callers resume interrupted runs, by carrying
//! a [`ResumeValue`] back to the paused task.

use crate::send::Send;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Which graph a command applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandGraph {
    /// The graph the node runs in (the default).
    Current,
    /// The closest enclosing parent graph.
    Parent,
    /// A named ancestor graph (the node name under which a subgraph was
    /// attached).
    #[serde(untagged)]
    Named(String),
}

/// Routing target of a command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum GotoTarget {
    /// A single node, run with input read from its channels.
    Node(String),
    /// Several nodes, all scheduled for the next superstep.
    Nodes(Vec<String>),
    /// A single send with an explicit payload.
    Send(Send),
    /// Several sends.
    Sends(Vec<Send>),
}

impl GotoTarget {
    /// Flatten into the equivalent list of sends.
    pub fn into_sends(self) -> Vec<Send> {
        match self {
            GotoTarget::Node(node) => vec![Send::to(node)],
            GotoTarget::Nodes(nodes) => nodes.into_iter().map(Send::to).collect(),
            GotoTarget::Send(send) => vec![send],
            GotoTarget::Sends(sends) => sends,
        }
    }
}

/// Value handed back to an interrupted task on resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResumeValue {
    /// Answers every pending interrupt id (keys are interrupt ids).
    ByInterruptId(HashMap<String, Value>),
    /// A single value for the run's sole pending interrupt.
    Single(Value),
}

/// A state update and/or routing directive returned by a node (or supplied
/// by a caller to resume a paused run).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Command {
    /// Target graph; `None` means the current graph.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<CommandGraph>,

    /// Channel writes, as a `{channel: value}` object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,

    /// Resume value for a paused interrupt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeValue>,

    /// What to run next.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goto: Option<GotoTarget>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_graph(mut self, graph: CommandGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_update(mut self, update: Value) -> Self {
        self.update = Some(update);
        self
    }

    pub fn with_resume(mut self, resume: ResumeValue) -> Self {
        self.resume = Some(resume);
        self
    }

    pub fn with_goto(mut self, goto: GotoTarget) -> Self {
        self.goto = Some(goto);
        self
    }

    /// Shorthand for routing to a single node.
    pub fn goto_node(node: impl Into<String>) -> Self {
        Self::new().with_goto(GotoTarget::Node(node.into()))
    }

    /// Shorthand for resuming with a single value.
    pub fn resume(value: Value) -> Self {
        Self::new().with_resume(ResumeValue::Single(value))
    }

    /// Whether this command targets an enclosing graph rather than the one
    /// the node runs in.
    pub fn targets_parent(&self) -> bool {
        matches!(
            self.graph,
            Some(CommandGraph::Parent) | Some(CommandGraph::Named(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_update_and_goto_from_node_output() {
        let value = json!({
            "update": {"status": "routed"},
            "goto": "reviewer"
        });
        let command: Command = serde_json::from_value(value).unwrap();
        assert_eq!(command.update, Some(json!({"status": "routed"})));
        assert_eq!(command.goto, Some(GotoTarget::Node("reviewer".into())));
        assert!(!command.targets_parent());
    }

    #[test]
    fn parses_sends_goto() {
        let value = json!({
            "goto": [
                {"node": "worker", "arg": 1},
                {"node": "worker", "arg": 2}
            ]
        });
        let command: Command = serde_json::from_value(value).unwrap();
        let sends = command.goto.unwrap().into_sends();
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[0].node(), "worker");
        assert_eq!(sends[1].arg(), &json!(2));
    }

    #[test]
    fn parent_graph_targets() {
        let command = Command::new()
            .with_graph(CommandGraph::Parent)
            .with_update(json!({"done": true}));
        assert!(command.targets_parent());

        let named = Command::new().with_graph(CommandGraph::Named("outer".into()));
        assert!(named.targets_parent());

        let current = Command::new().with_graph(CommandGraph::Current);
        assert!(!current.targets_parent());
    }

    #[test]
    fn resume_values_deserialize_both_shapes() {
        let single: ResumeValue = serde_json::from_value(json!("approved")).unwrap();
        assert_eq!(single, ResumeValue::Single(json!("approved")));

        let by_id: ResumeValue =
            serde_json::from_value(json!({"task-1": "yes", "task-2": "no"})).unwrap();
        match by_id {
            ResumeValue::ByInterruptId(map) => assert_eq!(map.len(), 2),
            other => panic!("expected by-id resume, got {other:?}"),
        }
    }

    #[test]
    fn goto_nodes_flatten_to_sends() {
        let target = GotoTarget::Nodes(vec!["a".into(), "b".into()]);
        let sends = target.into_sends();
        assert_eq!(sends.len(), 2);
        assert!(sends.iter().all(|s| s.arg().is_null()));
    }
}
