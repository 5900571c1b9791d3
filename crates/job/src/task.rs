use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use rowmill_common::{MillError, Result};

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Lifecycle states shared by jobs, stages, and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningState {
    /// Created but not yet executing.
    Pending,
    /// Currently executing.
    Running,
    /// Finished without error.
    Succeeded,
    /// Finished with an error, panic, or cancellation.
    Failed,
}

impl RunningState {
    /// Terminal states are sticky.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunningState::Succeeded | RunningState::Failed)
    }

    fn ordinal(self) -> u8 {
        match self {
            RunningState::Pending => 0,
            RunningState::Running => 1,
            RunningState::Succeeded | RunningState::Failed => 2,
        }
    }
}

/// One executable unit: a `(job, stage, partition)` scheduled on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Owning job id.
    pub job_id: String,
    /// Owning stage name.
    pub stage_name: String,
    /// Partition this task consumes and produces.
    pub partition_id: String,
    /// Node the task is scheduled on.
    pub node_id: String,
}

impl Task {
    /// Build a task descriptor.
    pub fn new(
        job_id: impl Into<String>,
        stage_name: impl Into<String>,
        partition_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            stage_name: stage_name.into(),
            partition_id: partition_id.into(),
            node_id: node_id.into(),
        }
    }

    /// The task's globally unique reference.
    pub fn reference(&self) -> TaskReference {
        TaskReference {
            job_id: self.job_id.clone(),
            stage_name: self.stage_name.clone(),
            partition_id: self.partition_id.clone(),
        }
    }
}

/// Canonical task identity, serialized as `jobID/stageName/partitionID`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskReference {
    /// Owning job id.
    pub job_id: String,
    /// Owning stage name.
    pub stage_name: String,
    /// Partition id within the stage.
    pub partition_id: String,
}

impl fmt::Display for TaskReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.job_id, self.stage_name, self.partition_id
        )
    }
}

impl FromStr for TaskReference {
    type Err = MillError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(job), Some(stage), Some(partition))
                if !job.is_empty() && !stage.is_empty() && !partition.is_empty() =>
            {
                Ok(Self {
                    job_id: job.to_string(),
                    stage_name: stage.to_string(),
                    partition_id: partition.to_string(),
                })
            }
            _ => Err(MillError::InvalidArgument(format!(
                "malformed task reference: {s}"
            ))),
        }
    }
}

/// Point-in-time status of one task. Transitions are forward-only and
/// terminal values never change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Current lifecycle state.
    pub status: RunningState,
    /// Submission time, epoch milliseconds.
    pub submitted_at_ms: u64,
    /// Time the executor entered `Running`.
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    /// Time the executor reached a terminal state.
    #[serde(default)]
    pub finished_at_ms: Option<u64>,
    /// Counters aggregated from the user function.
    #[serde(default)]
    pub metrics: HashMap<String, i64>,
    /// Failure description for `Failed` tasks.
    #[serde(default)]
    pub error: Option<String>,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStatus {
    /// A fresh `Pending` status stamped with the current time.
    pub fn new() -> Self {
        Self {
            status: RunningState::Pending,
            submitted_at_ms: epoch_ms(),
            started_at_ms: None,
            finished_at_ms: None,
            metrics: HashMap::new(),
            error: None,
        }
    }

    /// Advance the state machine. Backward transitions and writes to a
    /// terminal status are rejected, returning `false`.
    pub fn advance(&mut self, to: RunningState) -> bool {
        if self.status.is_terminal() || to.ordinal() <= self.status.ordinal() {
            return false;
        }
        self.status = to;
        match to {
            RunningState::Running => self.started_at_ms = Some(epoch_ms()),
            RunningState::Succeeded | RunningState::Failed => {
                self.finished_at_ms = Some(epoch_ms())
            }
            RunningState::Pending => {}
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_round_trips() {
        let task = Task::new("J1", "map", "3", "W1");
        let reference = task.reference();
        assert_eq!(reference.to_string(), "J1/map/3");
        let parsed: TaskReference = "J1/map/3".parse().expect("parse");
        assert_eq!(parsed, reference);
    }

    #[test]
    fn malformed_references_are_rejected() {
        assert!("J1/map".parse::<TaskReference>().is_err());
        assert!("".parse::<TaskReference>().is_err());
        assert!("J1//3".parse::<TaskReference>().is_err());
    }

    #[test]
    fn status_only_advances_forward() {
        let mut status = TaskStatus::new();
        assert!(status.advance(RunningState::Running));
        assert!(status.started_at_ms.is_some());
        assert!(!status.advance(RunningState::Pending));
        assert!(status.advance(RunningState::Succeeded));
        assert!(status.finished_at_ms.is_some());

        // Terminal values are immutable.
        assert!(!status.advance(RunningState::Failed));
        assert_eq!(status.status, RunningState::Succeeded);
    }

    #[test]
    fn pending_can_fail_directly() {
        let mut status = TaskStatus::new();
        assert!(status.advance(RunningState::Failed));
        assert!(status.status.is_terminal());
    }
}
