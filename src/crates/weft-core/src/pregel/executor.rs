//! Task execution with retries.

use crate::error::{GraphError, Result};
use crate::node::{NodeContext, NodeOutput};
use crate::pregel::types::PregelExecutableTask;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff policy for transient task failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry, in seconds.
    pub initial_interval: f64,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Upper bound on any single delay, in seconds.
    pub max_interval: f64,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 128.0,
            max_attempts: 3,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries: a single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_interval * self.backoff_factor.powi(exponent);
        let mut secs = base.min(self.max_interval);
        if self.jitter {
            secs *= 1.0 + rand::thread_rng().gen_range(0.0..0.25);
        }
        Duration::from_secs_f64(secs)
    }
}

/// Runs one task under its retry policy.
pub struct TaskExecutor;

impl TaskExecutor {
    /// Execute the task, retrying transient failures per its policy.
    ///
    /// Interrupts and other control signals pass through untouched and are
    /// never retried. A task that exhausts its attempts fails with
    /// `NodeExecution`, naming the task and its node.
    pub async fn execute(task: &PregelExecutableTask, ctx: NodeContext) -> Result<NodeOutput> {
        let policy = task.retry_policy.clone().unwrap_or_else(RetryPolicy::none);
        let max_attempts = policy.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            tracing::debug!(task_id = %task.id, node = %task.name, attempt, "executing task");
            match task.executor.execute(task.input.clone(), ctx.clone()).await {
                Ok(output) => {
                    tracing::debug!(task_id = %task.id, node = %task.name, "task completed");
                    return Ok(output);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    tracing::error!(
                        task_id = %task.id,
                        node = %task.name,
                        attempts = attempt,
                        error = %err,
                        "task failed"
                    );
                    return Err(GraphError::NodeExecution {
                        task_id: task.id.clone(),
                        node: task.name.clone(),
                        error: err.to_string(),
                    });
                }
                Err(err) => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        task_id = %task.id,
                        node = %task.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "task failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::node_fn;
    use crate::pregel::types::{PathSegment, PULL};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn task_with(
        executor: Arc<dyn crate::node::NodeExecutor>,
        retry_policy: Option<RetryPolicy>,
    ) -> PregelExecutableTask {
        PregelExecutableTask {
            id: "task-1".to_string(),
            name: "flaky".to_string(),
            input: Value::Null,
            executor,
            triggers: vec![],
            writes_allowed: vec![],
            retry_policy,
            path: vec![
                PathSegment::String(PULL.into()),
                PathSegment::String("flaky".into()),
            ],
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let task = task_with(
            node_fn(|_, _| async { Ok(NodeOutput::update(json!({"ok": true}))) }),
            None,
        );
        let out = TaskExecutor::execute(&task, NodeContext::default())
            .await
            .unwrap();
        assert_eq!(out, NodeOutput::Update(json!({"ok": true})));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let task = task_with(
            node_fn(move |_, _| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(GraphError::Execution("transient".into()))
                    } else {
                        Ok(NodeOutput::empty())
                    }
                }
            }),
            Some(RetryPolicy {
                jitter: false,
                ..RetryPolicy::default()
            }),
        );

        let out = TaskExecutor::execute(&task, NodeContext::default()).await;
        assert!(out.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_name_the_task() {
        let task = task_with(
            node_fn(|_, _| async { Err(GraphError::Execution("always broken".into())) }),
            Some(RetryPolicy {
                max_attempts: 2,
                jitter: false,
                ..RetryPolicy::default()
            }),
        );

        let err = TaskExecutor::execute(&task, NodeContext::default())
            .await
            .unwrap_err();
        match err {
            GraphError::NodeExecution { task_id, node, error } => {
                assert_eq!(task_id, "task-1");
                assert_eq!(node, "flaky");
                assert!(error.contains("always broken"));
            }
            other => panic!("expected node execution error, got {other}"),
        }
    }

    #[tokio::test]
    async fn interrupt_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let task = task_with(
            node_fn(move |_, ctx: NodeContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ctx.interrupt(json!("approve?")).map(NodeOutput::update)
                }
            }),
            Some(RetryPolicy::default()),
        );

        let err = TaskExecutor::execute(&task, NodeContext::new("task-1", "flaky", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Interrupted(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            initial_interval: 1.0,
            backoff_factor: 2.0,
            max_interval: 4.0,
            max_attempts: 10,
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs_f64(1.0));
        assert_eq!(policy.delay_for(2), Duration::from_secs_f64(2.0));
        assert_eq!(policy.delay_for(3), Duration::from_secs_f64(4.0));
        assert_eq!(policy.delay_for(6), Duration::from_secs_f64(4.0));
    }
}
