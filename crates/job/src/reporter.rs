//! Periodic task-status reporting to the coordinator.
//!
//! Non-terminal updates are cached and flushed on a tick so a chatty
//! executor does not turn every state change into a coordinator write.
//! Terminal reports flush immediately, bump the stage's done-task counters,
//! and on failure append the error text under the job's error prefix so the
//! master's watch can surface it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use rowmill_common::Result;
use rowmill_coordinator::{put_as, Coordinator};

use crate::manager::{JOB_ERROR_NS, JOB_STATUS_NS, STAGE_STATUS_NS, TASK_STATUS_NS};
use crate::task::{RunningState, TaskReference, TaskStatus};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

struct Tracked {
    status: TaskStatus,
    dirty: bool,
}

/// Buffers task-status updates and writes them to the coordinator.
pub struct JobReporter {
    crd: Arc<dyn Coordinator>,
    tracked: Mutex<HashMap<String, Tracked>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl JobReporter {
    /// Build a reporter over a coordinator handle.
    pub fn new(crd: Arc<dyn Coordinator>) -> Arc<Self> {
        Arc::new(Self {
            crd,
            tracked: Mutex::new(HashMap::new()),
            flusher: Mutex::new(None),
        })
    }

    /// Track a freshly created task's status.
    pub fn add(&self, reference: &TaskReference, status: TaskStatus) {
        self.tracked
            .lock()
            .expect("reporter lock poisoned")
            .insert(
                reference.to_string(),
                Tracked {
                    status,
                    dirty: false,
                },
            );
    }

    /// Record that the executor entered `Running`; flushed on the next tick.
    pub fn mark_running(&self, reference: &TaskReference) {
        let mut tracked = self.tracked.lock().expect("reporter lock poisoned");
        let entry = tracked
            .entry(reference.to_string())
            .or_insert_with(|| Tracked {
                status: TaskStatus::new(),
                dirty: false,
            });
        if entry.status.advance(RunningState::Running) {
            entry.dirty = true;
        }
    }

    /// Start the periodic flush loop.
    pub fn start(self: &Arc<Self>) {
        let reporter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                reporter.flush_dirty().await;
            }
        });
        let mut flusher = self.flusher.lock().expect("reporter lock poisoned");
        if let Some(old) = flusher.replace(handle) {
            old.abort();
        }
    }

    async fn flush_dirty(&self) {
        let snapshot: Vec<(String, TaskStatus)> = {
            let mut tracked = self.tracked.lock().expect("reporter lock poisoned");
            tracked
                .iter_mut()
                .filter(|(_, t)| t.dirty)
                .map(|(reference, t)| {
                    t.dirty = false;
                    (reference.clone(), t.status.clone())
                })
                .collect()
        };
        for (reference, status) in snapshot {
            if let Err(e) = self.write_status(&reference, &status).await {
                warn!(task = %reference, error = %e, "status flush failed");
            }
        }
    }

    async fn write_status(&self, reference: &str, status: &TaskStatus) -> Result<()> {
        put_as(
            self.crd.as_ref(),
            &format!("{TASK_STATUS_NS}/{reference}"),
            status,
            None,
        )
        .await
    }

    /// Advance a tracked status to a terminal state. Returns `None` when the
    /// status is already terminal, making repeated terminal reports no-ops.
    fn advance_terminal(
        &self,
        reference: &TaskReference,
        to: RunningState,
        metrics: HashMap<String, i64>,
        error: Option<String>,
    ) -> Option<TaskStatus> {
        let mut tracked = self.tracked.lock().expect("reporter lock poisoned");
        let entry = tracked
            .entry(reference.to_string())
            .or_insert_with(|| Tracked {
                status: TaskStatus::new(),
                dirty: false,
            });
        if !entry.status.advance(to) {
            return None;
        }
        entry.status.metrics = metrics;
        entry.status.error = error;
        entry.dirty = false;
        Some(entry.status.clone())
    }

    /// Drop a tracked entry once its task has been reaped.
    pub fn forget(&self, reference: &TaskReference) {
        self.tracked
            .lock()
            .expect("reporter lock poisoned")
            .remove(&reference.to_string());
    }

    /// Write terminal success: status plus the stage done-task counter.
    pub async fn report_success(
        &self,
        reference: &TaskReference,
        metrics: HashMap<String, i64>,
    ) -> Result<()> {
        let status = match self.advance_terminal(reference, RunningState::Succeeded, metrics, None)
        {
            Some(status) => status,
            None => return Ok(()),
        };
        self.write_status(&reference.to_string(), &status).await?;
        self.crd
            .increment_counter(&format!(
                "{STAGE_STATUS_NS}/{}/{}/doneTasks",
                reference.job_id, reference.stage_name
            ))
            .await?;
        Ok(())
    }

    /// Write terminal failure: status, done/failed counters, and the error
    /// text appended under the job's error prefix.
    pub async fn report_failure(&self, reference: &TaskReference, error: String) -> Result<()> {
        let status = match self.advance_terminal(
            reference,
            RunningState::Failed,
            HashMap::new(),
            Some(error.clone()),
        ) {
            Some(status) => status,
            None => return Ok(()),
        };
        self.write_status(&reference.to_string(), &status).await?;
        self.crd
            .increment_counter(&format!(
                "{STAGE_STATUS_NS}/{}/{}/doneTasks",
                reference.job_id, reference.stage_name
            ))
            .await?;
        self.crd
            .increment_counter(&format!(
                "{STAGE_STATUS_NS}/{}/{}/failedTasks",
                reference.job_id, reference.stage_name
            ))
            .await?;
        let seq = self
            .crd
            .increment_counter(&format!("{JOB_STATUS_NS}/{}/totalErrors", reference.job_id))
            .await?;
        put_as(
            self.crd.as_ref(),
            &format!("{JOB_ERROR_NS}/{}/{seq}", reference.job_id),
            &error,
            None,
        )
        .await
    }

    /// Flush outstanding updates and stop the flush loop.
    pub async fn close(&self) {
        self.flush_dirty().await;
        if let Some(handle) = self
            .flusher
            .lock()
            .expect("reporter lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}
