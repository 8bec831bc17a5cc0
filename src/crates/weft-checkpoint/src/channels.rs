//! Channel abstractions for shared state.
//!
//! Channels are named, versioned state cells. Each channel type defines how
//! the writes produced within one superstep combine into a new value: the
//! default [`LastValueChannel`] keeps the last write, [`TopicChannel`]
//! accumulates an append-only log, and [`BinaryOperatorChannel`] folds writes
//! through a caller-supplied associative reducer. [`EphemeralValueChannel`]
//! holds a value for exactly one superstep and is used for the input trigger.
//!
//! All channels support a lossless checkpoint round-trip via
//! [`Channel::checkpoint`] / [`Channel::from_checkpoint`].

use crate::error::{CheckpointError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// Base trait for all channels.
///
/// A channel with no accepted write yet is "missing": `get()` returns
/// [`CheckpointError::EmptyChannel`] and `is_available()` returns `false`.
/// This sentinel is distinguishable from every valid value, including `null`.
pub trait Channel: Send + Sync + Debug {
    /// Get the current value of the channel.
    ///
    /// # Errors
    ///
    /// Returns `EmptyChannelError` if the channel has never been updated.
    fn get(&self) -> Result<Value>;

    /// Update the channel with the writes collected for one superstep.
    ///
    /// The values arrive in the deterministic task order established by the
    /// scheduler. An empty vector is a no-op (the MISSING write). Returns
    /// `true` if the channel's value changed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUpdate` if the writes cannot be accepted.
    fn update(&mut self, values: Vec<Value>) -> Result<bool>;

    /// Create a serializable snapshot of the channel's current value.
    fn checkpoint(&self) -> Result<Value>;

    /// Restore the channel from a snapshot produced by [`Channel::checkpoint`].
    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()>;

    /// Whether the channel currently holds a value.
    fn is_available(&self) -> bool {
        self.get().is_ok()
    }

    /// Notify the channel that a subscribed task consumed it this superstep.
    ///
    /// Returns `true` if the channel was changed.
    fn consume(&mut self) -> bool {
        false
    }

    /// Notify the channel that the run is finishing.
    ///
    /// Returns `true` if the channel was changed.
    fn finish(&mut self) -> bool {
        false
    }

    /// Clone the channel into a box.
    fn clone_box(&self) -> Box<dyn Channel>;
}

/// Stores the last value written in a superstep (the default reducer).
///
/// When several tasks write to the channel within one superstep, the write
/// from the task latest in the scheduler's stable ordering wins.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LastValueChannel {
    value: Option<Value>,
}

impl LastValueChannel {
    pub fn new() -> Self {
        Self { value: None }
    }

    pub fn with_value(value: Value) -> Self {
        Self { value: Some(value) }
    }
}

impl Channel for LastValueChannel {
    fn get(&self) -> Result<Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("last_value".to_string()))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        match values.into_iter().last() {
            Some(last) => {
                self.value = Some(last);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn checkpoint(&self) -> Result<Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("last_value".to_string()))
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        self.value = Some(checkpoint);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Append-only log of values, for channels used as accumulating logs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopicChannel {
    values: Vec<Value>,
}

impl TopicChannel {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// All accumulated values, in arrival order.
    pub fn get_all(&self) -> &[Value] {
        &self.values
    }
}

impl Channel for TopicChannel {
    fn get(&self) -> Result<Value> {
        Ok(Value::Array(self.values.clone()))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        self.values.extend(values);
        Ok(true)
    }

    fn checkpoint(&self) -> Result<Value> {
        Ok(Value::Array(self.values.clone()))
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        match checkpoint {
            Value::Array(arr) => {
                self.values = arr;
                Ok(())
            }
            other => Err(CheckpointError::InvalidUpdate(format!(
                "topic channel checkpoint must be an array, got {other}"
            ))),
        }
    }

    fn is_available(&self) -> bool {
        !self.values.is_empty()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Reducer function for [`BinaryOperatorChannel`].
pub type ReducerFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// Numeric sum reducer.
pub fn sum_reducer() -> ReducerFn {
    Arc::new(|a, b| {
        let a = a.as_f64().unwrap_or(0.0);
        let b = b.as_f64().unwrap_or(0.0);
        serde_json::json!(a + b)
    })
}

/// Array append reducer. Non-array operands are treated as singletons.
pub fn append_reducer() -> ReducerFn {
    Arc::new(|a, b| {
        let mut out = match a {
            Value::Array(arr) => arr,
            other => vec![other],
        };
        match b {
            Value::Array(arr) => out.extend(arr),
            other => out.push(other),
        }
        Value::Array(out)
    })
}

/// Folds concurrent writes through an associative binary operator.
///
/// The reducer must be associative so that the final value is independent of
/// how writes within a superstep are grouped.
#[derive(Clone)]
pub struct BinaryOperatorChannel {
    value: Option<Value>,
    reducer: ReducerFn,
}

impl BinaryOperatorChannel {
    pub fn new<F>(reducer: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        Self {
            value: None,
            reducer: Arc::new(reducer),
        }
    }

    pub fn from_reducer(reducer: ReducerFn) -> Self {
        Self {
            value: None,
            reducer,
        }
    }

    /// Channel folding through [`sum_reducer`].
    pub fn sum() -> Self {
        Self::from_reducer(sum_reducer())
    }

    /// Channel folding through [`append_reducer`].
    pub fn append() -> Self {
        Self::from_reducer(append_reducer())
    }
}

impl Debug for BinaryOperatorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryOperatorChannel")
            .field("value", &self.value)
            .field("reducer", &"<function>")
            .finish()
    }
}

impl Channel for BinaryOperatorChannel {
    fn get(&self) -> Result<Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("binary_operator".to_string()))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        let mut iter = values.into_iter();
        let Some(first) = iter.next() else {
            return Ok(false);
        };
        let mut acc = match self.value.take() {
            Some(current) => (self.reducer)(current, first),
            None => first,
        };
        for value in iter {
            acc = (self.reducer)(acc, value);
        }
        self.value = Some(acc);
        Ok(true)
    }

    fn checkpoint(&self) -> Result<Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("binary_operator".to_string()))
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        self.value = Some(checkpoint);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Holds a value for exactly one superstep.
///
/// The scheduler notifies untouched channels at each barrier with an empty
/// update; an ephemeral channel clears itself on that notification. Used for
/// the input trigger channel so entry nodes fire once per seeded input.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EphemeralValueChannel {
    value: Option<Value>,
}

impl EphemeralValueChannel {
    pub fn new() -> Self {
        Self { value: None }
    }
}

impl Channel for EphemeralValueChannel {
    fn get(&self) -> Result<Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("ephemeral_value".to_string()))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        match values.into_iter().last() {
            Some(last) => {
                self.value = Some(last);
                Ok(true)
            }
            // Superstep notification: the value expires.
            None => Ok(self.value.take().is_some()),
        }
    }

    fn checkpoint(&self) -> Result<Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("ephemeral_value".to_string()))
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        self.value = Some(checkpoint);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn last_value_keeps_latest_write() {
        let mut channel = LastValueChannel::new();
        assert!(!channel.is_available());

        let updated = channel.update(vec![json!(1), json!(2), json!(3)]).unwrap();
        assert!(updated);
        assert_eq!(channel.get().unwrap(), json!(3));

        channel.update(vec![json!(100)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(100));
    }

    #[test]
    fn empty_update_is_noop() {
        let mut channel = LastValueChannel::new();
        assert!(!channel.update(vec![]).unwrap());
        assert!(!channel.is_available());

        channel.update(vec![json!(1)]).unwrap();
        assert!(!channel.update(vec![]).unwrap());
        assert_eq!(channel.get().unwrap(), json!(1));
    }

    #[test]
    fn topic_accumulates_in_order() {
        let mut channel = TopicChannel::new();
        channel.update(vec![json!(1), json!(2)]).unwrap();
        channel.update(vec![json!(3)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn topic_checkpoint_preserves_order() {
        let mut channel = TopicChannel::new();
        channel
            .update(vec![json!("a"), json!("b"), json!("c")])
            .unwrap();

        let snapshot = channel.checkpoint().unwrap();
        let mut restored = TopicChannel::new();
        restored.from_checkpoint(snapshot).unwrap();
        assert_eq!(restored.get().unwrap(), json!(["a", "b", "c"]));
    }

    #[test]
    fn topic_rejects_non_array_checkpoint() {
        let mut channel = TopicChannel::new();
        assert!(channel.from_checkpoint(json!(42)).is_err());
    }

    #[test]
    fn binary_operator_sum() {
        let mut channel = BinaryOperatorChannel::sum();
        channel
            .update(vec![json!(1.0), json!(2.0), json!(3.0)])
            .unwrap();
        assert_eq!(channel.get().unwrap(), json!(6.0));

        channel.update(vec![json!(4.0)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(10.0));
    }

    #[test]
    fn binary_operator_append() {
        let mut channel = BinaryOperatorChannel::append();
        channel.update(vec![json!([1]), json!(2)]).unwrap();
        channel.update(vec![json!([3])]).unwrap();
        assert_eq!(channel.get().unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn binary_operator_clone_keeps_reducer() {
        let mut channel = BinaryOperatorChannel::sum();
        channel.update(vec![json!(2.0)]).unwrap();

        let mut cloned = channel.clone_box();
        cloned.update(vec![json!(3.0)]).unwrap();
        assert_eq!(cloned.get().unwrap(), json!(5.0));
        // Original unaffected by the clone's update.
        assert_eq!(channel.get().unwrap(), json!(2.0));
    }

    #[test]
    fn ephemeral_clears_on_superstep_notification() {
        let mut channel = EphemeralValueChannel::new();
        channel.update(vec![json!({"seed": true})]).unwrap();
        assert!(channel.is_available());

        assert!(channel.update(vec![]).unwrap());
        assert!(!channel.is_available());
        assert!(!channel.update(vec![]).unwrap());
    }

    #[test]
    fn checkpoint_restore_round_trip() {
        let mut channel = LastValueChannel::new();
        let value = json!({"nested": {"list": [1, 2, 3], "flag": true}});
        channel.update(vec![value.clone()]).unwrap();

        let snapshot = channel.checkpoint().unwrap();
        let mut restored = LastValueChannel::new();
        restored.from_checkpoint(snapshot).unwrap();
        assert_eq!(restored.get().unwrap(), value);
    }

    #[test]
    fn empty_channel_get_errors() {
        let channel = LastValueChannel::new();
        assert!(matches!(
            channel.get(),
            Err(CheckpointError::EmptyChannel(_))
        ));
    }

    proptest! {
        // Associative reducers must be order-insensitive across permutations
        // of concurrent writes.
        #[test]
        fn sum_invariant_under_permutation(values in prop::collection::vec(-1000i64..1000, 1..16)) {
            let mut forward = BinaryOperatorChannel::sum();
            forward.update(values.iter().map(|v| json!(*v as f64)).collect()).unwrap();

            let mut reversed = BinaryOperatorChannel::sum();
            reversed.update(values.iter().rev().map(|v| json!(*v as f64)).collect()).unwrap();

            prop_assert_eq!(forward.get().unwrap(), reversed.get().unwrap());
        }
    }
}
