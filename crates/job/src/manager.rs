//! Coordinator-backed job state: creation, lookup, and error streams.
//!
//! Key layout (exact):
//! - `jobs/<jobID>` — job record
//! - `tasks/<taskID>` — task record
//! - `status/jobs/<jobID>`, `status/stages/<jobID>/<stage>`,
//!   `status/tasks/<ref>`, `status/node/<nodeID>` — status and counters
//! - `errors/jobs/<jobID>/<n>` — failure texts, watchable

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use rowmill_common::{MillError, Result};
use rowmill_coordinator::{get_as, Coordinator, Txn, WatchEvent};

use crate::job::{Job, Stage};
use crate::task::{epoch_ms, RunningState, Task, TaskReference, TaskStatus};

pub(crate) const JOB_NS: &str = "jobs";
pub(crate) const TASK_NS: &str = "tasks";
pub(crate) const JOB_STATUS_NS: &str = "status/jobs";
pub(crate) const STAGE_STATUS_NS: &str = "status/stages";
pub(crate) const TASK_STATUS_NS: &str = "status/tasks";
pub(crate) const NODE_STATUS_NS: &str = "status/node";
pub(crate) const JOB_ERROR_NS: &str = "errors/jobs";

/// Job-level status record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    /// Current lifecycle state.
    pub status: RunningState,
    /// Submission time, epoch milliseconds.
    pub submitted_at_ms: u64,
}

impl JobStatus {
    fn new() -> Self {
        Self {
            status: RunningState::Pending,
            submitted_at_ms: epoch_ms(),
        }
    }
}

/// Stage-level status record; task counters live beside it as counter keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStatus {
    /// Current lifecycle state.
    pub status: RunningState,
}

impl StageStatus {
    fn new() -> Self {
        Self {
            status: RunningState::Pending,
        }
    }
}

/// Coordinator-backed job/task persistence shared by masters and workers.
#[derive(Clone)]
pub struct JobManager {
    crd: Arc<dyn Coordinator>,
}

impl JobManager {
    /// Build a manager over a coordinator handle.
    pub fn new(crd: Arc<dyn Coordinator>) -> Self {
        Self { crd }
    }

    /// Persist a new job, its status, and one status record per stage in a
    /// single transaction.
    pub async fn create_job(&self, name: &str, stages: Vec<Stage>) -> Result<Job> {
        let job = Job::new(name, stages);
        let mut txn = Txn::new()
            .put(format!("{JOB_NS}/{}", job.id), &job)?
            .put(format!("{JOB_STATUS_NS}/{}", job.id), &JobStatus::new())?;
        for stage in &job.stages {
            txn = txn.put(
                format!("{STAGE_STATUS_NS}/{}/{}", job.id, stage.name),
                &StageStatus::new(),
            )?;
        }
        self.crd.commit(txn).await?;
        debug!(job_id = %job.id, name = %job.name, "job created");
        Ok(job)
    }

    /// Fetch a job record.
    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        get_as(self.crd.as_ref(), &format!("{JOB_NS}/{job_id}")).await
    }

    /// Collect the failure texts recorded for a job so far.
    pub async fn get_job_errors(&self, job_id: &str) -> Result<Vec<String>> {
        let items = self.crd.scan(&format!("{JOB_ERROR_NS}/{job_id}/")).await?;
        items.iter().map(|item| item.decode()).collect()
    }

    /// Stream failure texts as they are appended under the job error prefix.
    pub async fn watch_job_errors(&self, job_id: &str) -> mpsc::UnboundedReceiver<String> {
        let mut events = self.crd.watch(&format!("{JOB_ERROR_NS}/{job_id}/")).await;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let WatchEvent::Put(item) = event {
                    match item.decode::<String>() {
                        Ok(text) => {
                            if tx.send(text).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(key = %item.key, error = %e, "undecodable job error entry"),
                    }
                }
            }
        });
        rx
    }

    /// List jobs under an id prefix.
    pub async fn list_jobs(&self, prefix: &str) -> Result<Vec<Job>> {
        let items = self.crd.scan(&format!("{JOB_NS}/{prefix}")).await?;
        items.iter().map(|item| item.decode()).collect()
    }

    /// List tasks under a reference prefix, e.g. `jobID/` or `jobID/stage/`.
    pub async fn list_tasks(&self, prefix: &str) -> Result<Vec<Task>> {
        let items = self.crd.scan(&format!("{TASK_NS}/{prefix}")).await?;
        items.iter().map(|item| item.decode()).collect()
    }

    /// Persist a task and its initial status, incrementing the per-stage and
    /// per-node total-task counters in the same transaction.
    pub async fn create_task(&self, task: &Task) -> Result<TaskStatus> {
        let status = TaskStatus::new();
        let reference = task.reference();
        let txn = Txn::new()
            .put(format!("{TASK_NS}/{reference}"), task)?
            .put(format!("{TASK_STATUS_NS}/{reference}"), &status)?
            .increment_counter(format!(
                "{STAGE_STATUS_NS}/{}/{}/totalTasks",
                task.job_id, task.stage_name
            ))
            .increment_counter(format!("{NODE_STATUS_NS}/{}/totalTasks", task.node_id));
        self.crd
            .commit(txn)
            .await
            .map_err(|e| MillError::Internal(format!("task write: {e}")))?;
        Ok(status)
    }

    /// Fetch a task record.
    pub async fn get_task(&self, reference: &TaskReference) -> Result<Task> {
        get_as(self.crd.as_ref(), &format!("{TASK_NS}/{reference}")).await
    }

    /// Fetch a task status record.
    pub async fn get_task_status(&self, reference: &TaskReference) -> Result<TaskStatus> {
        get_as(self.crd.as_ref(), &format!("{TASK_STATUS_NS}/{reference}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowmill_coordinator::MemCoordinator;

    fn manager() -> (JobManager, Arc<dyn Coordinator>) {
        let crd: Arc<dyn Coordinator> = Arc::new(MemCoordinator::new());
        (JobManager::new(Arc::clone(&crd)), crd)
    }

    #[tokio::test]
    async fn create_job_persists_job_and_stage_statuses() {
        let (manager, crd) = manager();
        let job = manager
            .create_job(
                "wc",
                vec![Stage::new("map", "tokenize"), Stage::new("reduce", "count")],
            )
            .await
            .expect("create");

        let fetched = manager.get_job(&job.id).await.expect("get");
        assert_eq!(fetched.stages.len(), 2);
        assert!(crd
            .get(&format!("{STAGE_STATUS_NS}/{}/map", job.id))
            .await
            .is_ok());
        assert!(crd
            .get(&format!("{JOB_STATUS_NS}/{}", job.id))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn create_task_increments_counters() {
        let (manager, crd) = manager();
        let task = Task::new("J1", "map", "0", "W1");
        let status = manager.create_task(&task).await.expect("create");
        assert_eq!(status.status, RunningState::Pending);

        manager
            .create_task(&Task::new("J1", "map", "1", "W1"))
            .await
            .expect("create");

        assert_eq!(
            crd.read_counter(&format!("{STAGE_STATUS_NS}/J1/map/totalTasks"))
                .await
                .expect("counter"),
            2
        );
        assert_eq!(
            crd.read_counter(&format!("{NODE_STATUS_NS}/W1/totalTasks"))
                .await
                .expect("counter"),
            2
        );
        let fetched = manager
            .get_task(&task.reference())
            .await
            .expect("get task");
        assert_eq!(fetched.partition_id, "0");
    }

    #[tokio::test]
    async fn job_errors_scan_and_watch() {
        let (manager, crd) = manager();
        let mut errors = manager.watch_job_errors("J9").await;
        rowmill_coordinator::put_as(crd.as_ref(), "errors/jobs/J9/1", &"boom", None)
            .await
            .expect("put");

        assert_eq!(errors.recv().await.expect("event"), "boom");
        assert_eq!(
            manager.get_job_errors("J9").await.expect("scan"),
            vec!["boom".to_string()]
        );
    }
}
