use serde::{Deserialize, Serialize};
use serde_json::Value;

use rowmill_common::generate_id;

use crate::partitioner::PartitionerSpec;
use crate::task::epoch_ms;

/// A submitted job: an immutable DAG of stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Stable job identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Stages in submission order.
    pub stages: Vec<Stage>,
    /// Submission time, epoch milliseconds.
    pub submitted_at_ms: u64,
}

impl Job {
    /// Build a job with a freshly generated id.
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            id: generate_id("J"),
            name: name.into(),
            stages,
            submitted_at_ms: epoch_ms(),
        }
    }

    /// Look up a stage by name.
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// One transformation in the job DAG and how its rows are routed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name, unique within the job.
    pub name: String,
    /// Registered transform name resolved on the worker.
    pub function: String,
    /// Opaque parameters handed to the transform factory.
    #[serde(default)]
    pub function_params: Value,
    /// Name of the upstream stage feeding this one, if any.
    #[serde(default)]
    pub upstream: Option<String>,
    /// Name of the downstream stage this one feeds, if any.
    #[serde(default)]
    pub downstream: Option<String>,
    /// How inbound rows were routed to this stage's partitions.
    #[serde(default)]
    pub input_partitioner: Option<PartitionerSpec>,
    /// How emitted rows are routed to downstream partitions. `None` on a
    /// terminal or single-destination stage.
    #[serde(default)]
    pub output_partitioner: Option<PartitionerSpec>,
}

impl Stage {
    /// Build a stage with no routing metadata.
    pub fn new(name: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function: function.into(),
            function_params: Value::Null,
            upstream: None,
            downstream: None,
            input_partitioner: None,
            output_partitioner: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_carries_generated_id_and_stage_lookup() {
        let job = Job::new(
            "wordcount",
            vec![Stage::new("map", "tokenize"), Stage::new("reduce", "count")],
        );
        assert!(job.id.starts_with('J'));
        assert!(job.stage("map").is_some());
        assert!(job.stage("missing").is_none());
    }

    #[test]
    fn stage_json_defaults_optional_fields() {
        let stage: Stage =
            serde_json::from_str(r#"{"name":"map","function":"identity"}"#).expect("decode");
        assert!(stage.downstream.is_none());
        assert!(stage.output_partitioner.is_none());
        assert!(stage.function_params.is_null());
    }
}
