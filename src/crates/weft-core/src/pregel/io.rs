//! Mapping between caller-facing values and channel writes.

use crate::graph::INPUT;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use weft_checkpoint::Channel;

/// Translate a run's input into the writes that seed the first superstep.
///
/// The whole value always lands on the input trigger channel so entry nodes
/// fire. If the input is an object whose keys are all declared channels,
/// each key additionally seeds its channel directly, so callers can
/// initialize state in one shot.
pub fn map_input(input: Value, declared: &HashSet<String>) -> Vec<(String, Value)> {
    let mut writes = vec![(INPUT.to_string(), input.clone())];
    if let Value::Object(map) = input {
        if !map.is_empty() && map.keys().all(|k| declared.contains(k)) {
            for (key, value) in map {
                writes.push((key, value));
            }
        }
    }
    writes
}

/// Project channels into the value a caller sees.
///
/// Only the named output channels are included, and only when they hold a
/// value. A single output channel yields its bare value rather than a
/// one-key object.
pub fn map_output(
    channels: &HashMap<String, Box<dyn Channel>>,
    output_channels: &[String],
) -> Value {
    if let [only] = output_channels {
        return channels
            .get(only)
            .and_then(|c| c.get().ok())
            .unwrap_or(Value::Null);
    }

    let mut view = serde_json::Map::new();
    for name in output_channels {
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
    use serde_json::json;

    fn channels(specs: &[(&str, ChannelType)]) -> HashMap<String, Box<dyn Channel>> {
        specs
            .iter()
            .map(|(name, t)| (name.to_string(), t.build()))
            .collect()
    }

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn object_input_seeds_matching_channels() {
        let declared = names(&["messages", "total"]);
        let writes = map_input(json!({"messages": ["hi"], "total": 1}), &declared);

        assert_eq!(writes[0].0, INPUT);
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().any(|(c, _)| c == "messages"));
        assert!(writes.iter().any(|(c, _)| c == "total"));
    }

    #[test]
    fn unmatched_input_only_seeds_the_trigger() {
        let declared = names(&["messages"]);

        // Scalar input.
        let writes = map_input(json!("run it"), &declared);
        assert_eq!(writes, vec![(INPUT.to_string(), json!("run it"))]);

        // Object with a key that is not a channel: passed through whole.
        let writes = map_input(json!({"messages": [], "other": 1}), &declared);
        assert_eq!(writes.len(), 1);
    }

    #[test]
    fn single_output_channel_is_bare() {
        let mut map = channels(&[("result", ChannelType::LastValue)]);
        map.get_mut("result").unwrap().update(vec![json!(42)]).unwrap();

        let out = map_output(&map, &["result".to_string()]);
        assert_eq!(out, json!(42));
    }

    #[test]
    fn multiple_outputs_compose_and_skip_empty() {
        let mut map = channels(&[
            ("a", ChannelType::LastValue),
            ("b", ChannelType::LastValue),
        ]);
        map.get_mut("a").unwrap().update(vec![json!(1)]).unwrap();

        let out = map_output(&map, &["a".to_string(), "b".to_string()]);
        assert_eq!(out, json!({"a": 1}));
    }
}
