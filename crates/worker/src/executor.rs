//! Task executor: owns one task from construction to terminal status.
//!
//! State machine: `Pending -> Running -> {Succeeded, Failed}`. Transitions
//! are total: user errors, panics, and cancellation all land in `Failed`,
//! and terminal states are sticky. Output sinks are flushed and closed
//! before the terminal status becomes visible to `wait_for_finish` callers,
//! so an inbound push acknowledgement happens-after the task's completion.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Once};

use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use rowmill_common::{MillError, Row};
use rowmill_job::{JobReporter, RunningState, Task, TaskContext, TaskReference, Transform};

use crate::input::{Feed, Reader};
use crate::output::Writer;

thread_local! {
    static LAST_PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_TRAP: Once = Once::new();

/// Record a backtrace for the panicking thread so the executor can attach
/// it to the failure report. The previous hook still runs.
fn install_panic_trap() {
    PANIC_TRAP.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            LAST_PANIC_STACK.with(|slot| {
                *slot.borrow_mut() = Some(Backtrace::force_capture().to_string());
            });
            previous(info);
        }));
    });
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    let stack = LAST_PANIC_STACK.with(|slot| slot.borrow_mut().take());
    match stack {
        Some(stack) => format!("panic: {message}\n{stack}"),
        None => format!("panic: {message}"),
    }
}

enum Outcome {
    Success,
    Error(MillError),
    Panicked(String),
    Cancelled,
}

struct RunParts {
    function: Box<dyn Transform>,
    input: Reader,
    output: Writer,
}

/// Owns one task's lifecycle: input, output, user function, and status.
pub struct TaskExecutor {
    task: Task,
    reference: TaskReference,
    ctx: TaskContext,
    reporter: Arc<JobReporter>,
    parts: Mutex<Option<RunParts>>,
    input_feed: Mutex<Option<Feed>>,
    pull_output: Mutex<Option<mpsc::Receiver<Vec<Row>>>>,
    abort_reason: Mutex<Option<String>>,
    state_tx: watch::Sender<RunningState>,
    state_rx: watch::Receiver<RunningState>,
}

impl TaskExecutor {
    /// Bind a task to its function, input queue, and output writer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: TaskContext,
        task: Task,
        function: Box<dyn Transform>,
        input: (Feed, Reader),
        output: Writer,
        pull_output: Option<mpsc::Receiver<Vec<Row>>>,
        reporter: Arc<JobReporter>,
    ) -> Self {
        install_panic_trap();
        let (feed, reader) = input;
        let (state_tx, state_rx) = watch::channel(RunningState::Pending);
        Self {
            reference: task.reference(),
            task,
            ctx,
            reporter,
            parts: Mutex::new(Some(RunParts {
                function,
                input: reader,
                output,
            })),
            input_feed: Mutex::new(Some(feed)),
            pull_output: Mutex::new(pull_output),
            abort_reason: Mutex::new(None),
            state_tx,
            state_rx,
        }
    }

    /// The task this executor owns.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// The task's canonical reference.
    pub fn reference(&self) -> &TaskReference {
        &self.reference
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunningState {
        *self.state_rx.borrow()
    }

    /// Hand the input feed to the task's sole inbound producer. Subsequent
    /// calls return `None`, upholding the one-producer invariant.
    pub fn take_input_feed(&self) -> Option<Feed> {
        self.input_feed
            .lock()
            .expect("executor lock poisoned")
            .take()
    }

    /// Hand the pull-mode output to the task's sole PollData consumer.
    pub fn take_pull_output(&self) -> Option<mpsc::Receiver<Vec<Row>>> {
        self.pull_output
            .lock()
            .expect("executor lock poisoned")
            .take()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    /// Terminate the task with an externally observed failure, e.g. a broken
    /// inbound push stream.
    pub fn terminate(&self, reason: String) {
        let mut slot = self.abort_reason.lock().expect("executor lock poisoned");
        slot.get_or_insert(reason);
        drop(slot);
        self.ctx.cancel();
    }

    /// Block until the task reaches a terminal state.
    pub async fn wait_for_finish(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }

    /// Run the task to completion. Consumes the bound function, input, and
    /// output; later invocations are no-ops.
    pub async fn run(self: Arc<Self>) {
        let parts = match self.parts.lock().expect("executor lock poisoned").take() {
            Some(parts) => parts,
            None => return,
        };
        let RunParts {
            function,
            input,
            mut output,
        } = parts;

        let _ = self.state_tx.send(RunningState::Running);
        self.reporter.mark_running(&self.reference);
        info!(task = %self.reference, "task execution started");

        let input_stream = input.into_stream().boxed();
        let mut work = Box::pin(
            AssertUnwindSafe(function.apply(&self.ctx, input_stream, &mut output)).catch_unwind(),
        );
        let outcome = tokio::select! {
            result = &mut work => match result {
                Ok(Ok(())) => Outcome::Success,
                Ok(Err(e)) => Outcome::Error(e),
                Err(payload) => Outcome::Panicked(panic_text(payload)),
            },
            _ = self.ctx.cancelled() => Outcome::Cancelled,
        };
        drop(work);

        // Sinks must be flushed and closed before terminal status becomes
        // visible. Cancellation drops buffered rows instead of flushing.
        let outcome = if matches!(outcome, Outcome::Cancelled) {
            drop(output);
            outcome
        } else {
            match (outcome, output.close().await) {
                (Outcome::Success, Err(e)) => Outcome::Error(e),
                (outcome, _) => outcome,
            }
        };

        match outcome {
            Outcome::Success => {
                if let Err(e) = self
                    .reporter
                    .report_success(&self.reference, self.ctx.metrics())
                    .await
                {
                    warn!(task = %self.reference, error = %e, "terminal status write failed");
                }
                info!(task = %self.reference, "task execution succeeded");
                let _ = self.state_tx.send(RunningState::Succeeded);
            }
            Outcome::Error(e) => self.fail(e.to_string()).await,
            Outcome::Panicked(text) => self.fail(text).await,
            Outcome::Cancelled => {
                let reason = self
                    .abort_reason
                    .lock()
                    .expect("executor lock poisoned")
                    .take()
                    .unwrap_or_else(|| MillError::Cancelled.to_string());
                self.fail(reason).await
            }
        }
    }

    async fn fail(&self, error: String) {
        error!(task = %self.reference, error = %error, "task execution failed");
        if let Err(e) = self.reporter.report_failure(&self.reference, error).await {
            warn!(task = %self.reference, error = %e, "failure report failed");
        }
        let _ = self.state_tx.send(RunningState::Failed);
    }
}
