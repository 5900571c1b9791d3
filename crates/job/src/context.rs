use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::task::Task;

/// Counter aggregation shared between a task's context and its executor.
#[derive(Clone, Default)]
pub struct MetricsSink {
    counters: Arc<Mutex<HashMap<String, i64>>>,
}

impl MetricsSink {
    /// Add `delta` to the named counter.
    pub fn add(&self, name: &str, delta: i64) {
        let mut counters = self.counters.lock().expect("metrics lock poisoned");
        *counters.entry(name.to_string()).or_insert(0) += delta;
    }

    /// Snapshot all counters.
    pub fn snapshot(&self) -> HashMap<String, i64> {
        self.counters.lock().expect("metrics lock poisoned").clone()
    }
}

/// Task-scoped context handed to every transform invocation.
#[derive(Clone)]
pub struct TaskContext {
    task: Task,
    broadcasts: Arc<HashMap<String, Value>>,
    local_options: Arc<HashMap<String, Value>>,
    metrics: MetricsSink,
    cancel: CancellationToken,
}

impl TaskContext {
    /// Build a context for one task.
    pub fn new(
        task: Task,
        broadcasts: Arc<HashMap<String, Value>>,
        local_options: Arc<HashMap<String, Value>>,
    ) -> Self {
        Self {
            task,
            broadcasts,
            local_options,
            metrics: MetricsSink::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// The task this context belongs to.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Read-only broadcast value shipped with task creation.
    pub fn broadcast(&self, key: &str) -> Option<&Value> {
        self.broadcasts.get(key)
    }

    /// Worker-local option set before the worker started serving.
    pub fn local_option(&self, key: &str) -> Option<&Value> {
        self.local_options.get(key)
    }

    /// Accumulate a metric counter; published with terminal status.
    pub fn add_metric(&self, name: &str, delta: i64) {
        self.metrics.add(name, delta);
    }

    /// Snapshot of the metric counters.
    pub fn metrics(&self) -> HashMap<String, i64> {
        self.metrics.snapshot()
    }

    /// Request cooperative cancellation of the task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TaskContext {
        TaskContext::new(
            Task::new("J1", "map", "0", "W1"),
            Arc::new(HashMap::from([(
                "threshold".to_string(),
                Value::from(10_i64),
            )])),
            Arc::new(HashMap::new()),
        )
    }

    #[test]
    fn metrics_accumulate() {
        let ctx = context();
        ctx.add_metric("rows", 2);
        ctx.add_metric("rows", 3);
        assert_eq!(ctx.metrics()["rows"], 5);
    }

    #[test]
    fn broadcasts_are_visible() {
        let ctx = context();
        assert_eq!(ctx.broadcast("threshold"), Some(&Value::from(10_i64)));
        assert!(ctx.broadcast("missing").is_none());
    }

    #[tokio::test]
    async fn cancellation_latches() {
        let ctx = context();
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        assert!(ctx.is_cancelled());
        // Resolves immediately once cancelled.
        ctx.cancelled().await;
    }
}
