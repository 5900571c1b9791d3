//! Worker server: accepts stage creation and data-stream RPCs, routes them
//! to executors, and enforces task lifecycles.
//!
//! Shared state:
//! - the running-tasks registry maps task references to executors behind a
//!   read/write lock; push/poll handlers are the readers, create/remove the
//!   writers. Entries leave the registry when an inbound stream observes
//!   the executor terminal, or through the explicit abort path.
//! - worker-local options are set before `start` and read-only afterwards.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use futures::Stream;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use rowmill_cluster::{Node, NodeManager, NodeType};
use rowmill_common::{MillError, Result, Row, WorkerOptions};
use rowmill_coordinator::Coordinator;
use rowmill_job::{
    global_transform_registry, Job, JobManager, JobReporter, Stage, Task, TaskContext,
    TaskReference,
};
use rowmill_rpc::{row_batch, to_status, v1, DataHeader, NodeServer};

use crate::executor::TaskExecutor;
use crate::input;
use crate::output::{self, BufferedOutput, Output, PushStream, Writer};
use crate::pipe::LocalPipe;

struct WorkerInner {
    node_manager: Arc<NodeManager>,
    job_manager: JobManager,
    reporter: Arc<JobReporter>,
    running: RwLock<HashMap<String, Arc<TaskExecutor>>>,
    local_options: StdMutex<Arc<HashMap<String, Value>>>,
    node: OnceLock<Node>,
    opt: WorkerOptions,
}

impl WorkerInner {
    fn local_node(&self) -> Result<&Node> {
        self.node
            .get()
            .ok_or_else(|| MillError::Internal("worker not started".to_string()))
    }

    fn local_options(&self) -> Arc<HashMap<String, Value>> {
        Arc::clone(&self.local_options.lock().expect("options lock poisoned"))
    }

    async fn get_running(&self, task_id: &str) -> Option<Arc<TaskExecutor>> {
        self.running.read().await.get(task_id).cloned()
    }

    async fn remove_running(&self, task_id: &str) {
        if let Some(exec) = self.running.write().await.remove(task_id) {
            self.reporter.forget(exec.reference());
        }
    }

    async fn create_task(
        self: &Arc<Self>,
        job: &Job,
        stage: &Stage,
        partition_id: &str,
        broadcasts: &Arc<HashMap<String, Value>>,
        plan: &v1::OutputPlan,
    ) -> std::result::Result<(), Status> {
        let node = self.local_node().map_err(to_status)?;
        let task = Task::new(&job.id, &stage.name, partition_id, &node.id);
        let reference = task.reference();
        let status = self
            .job_manager
            .create_task(&task)
            .await
            .map_err(|e| Status::internal(format!("create task failed: {e}")))?;
        self.reporter.add(&reference, status);

        let ctx = TaskContext::new(task.clone(), Arc::clone(broadcasts), self.local_options());
        let (feed, reader) = input::channel(self.opt.input.queue_length);
        let (writer, pull_output) = match self.build_output(job, stage, plan).await {
            Ok(built) => built,
            Err(e) => {
                self.report_construction_failure(&reference, &e).await;
                return Err(Status::internal(format!("unable to create output: {e}")));
            }
        };
        let function = match global_transform_registry()
            .get(&stage.function)
            .ok_or_else(|| {
                MillError::InvalidArgument(format!("unknown function: {}", stage.function))
            })
            .and_then(|factory| factory.build(&stage.function_params))
        {
            Ok(function) => function,
            Err(e) => {
                self.report_construction_failure(&reference, &e).await;
                return Err(to_status(e));
            }
        };

        let exec = Arc::new(TaskExecutor::new(
            ctx,
            task,
            function,
            (feed, reader),
            writer,
            pull_output,
            Arc::clone(&self.reporter),
        ));
        self.running
            .write()
            .await
            .insert(reference.to_string(), Arc::clone(&exec));
        tokio::spawn(exec.run());
        Ok(())
    }

    async fn report_construction_failure(&self, reference: &TaskReference, error: &MillError) {
        if let Err(e) = self
            .reporter
            .report_failure(reference, error.to_string())
            .await
        {
            warn!(task = %reference, error = %e, "failure report failed");
        }
    }

    /// Build the task's output writer from the dispatch plan: a pull queue
    /// for consumer-driven stages, otherwise one sink per downstream
    /// partition, short-circuiting through a local pipe when the downstream
    /// task already runs on this worker.
    async fn build_output(
        &self,
        job: &Job,
        stage: &Stage,
        plan: &v1::OutputPlan,
    ) -> Result<(Writer, Option<mpsc::Receiver<Vec<Row>>>)> {
        if plan.mode() == v1::OutputMode::Pull {
            let (queue, rx) = output::pull_queue(self.opt.input.queue_length);
            let sinks: HashMap<String, Box<dyn Output>> =
                HashMap::from([("0".to_string(), Box::new(queue) as Box<dyn Output>)]);
            return Ok((Writer::new(None, sinks), Some(rx)));
        }
        if plan.partition_to_host.is_empty() {
            return Ok((Writer::new(None, HashMap::new()), None));
        }

        let node = self.local_node()?;
        let downstream = stage.downstream.as_ref().ok_or_else(|| {
            MillError::InvalidArgument(format!("stage {} has no downstream", stage.name))
        })?;
        let mut sinks: HashMap<String, Box<dyn Output>> = HashMap::new();
        for (partition_id, host) in &plan.partition_to_host {
            let task_id = format!("{}/{}/{}", job.id, downstream, partition_id);
            if *host == node.host {
                if let Some(target) = self.get_running(&task_id).await {
                    let feed = target.take_input_feed().ok_or_else(|| {
                        MillError::Internal(format!("input already bound: {task_id}"))
                    })?;
                    sinks.insert(partition_id.clone(), Box::new(LocalPipe::new(feed)));
                    continue;
                }
            }
            let channel = self.node_manager.connect(host).await?;
            let header = DataHeader {
                job_id: job.id.clone(),
                stage_name: downstream.clone(),
                partition_id: partition_id.clone(),
                from_host: node.host.clone(),
            };
            let stream = PushStream::open(channel, &header)?;
            sinks.insert(
                partition_id.clone(),
                Box::new(BufferedOutput::new(
                    Box::new(stream),
                    self.opt.output.buffer_length,
                )),
            );
        }
        Ok((
            Writer::new(stage.output_partitioner.clone(), sinks),
            None,
        ))
    }
}

/// Worker process: node registration, task executors, and the RPC server.
pub struct Worker {
    inner: Arc<WorkerInner>,
    serve: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Build a worker over a coordinator handle. The node manager may refuse
    /// construction when TLS credentials are configured but unreadable.
    pub fn new(crd: Arc<dyn Coordinator>, opt: WorkerOptions) -> Result<Self> {
        let node_manager = NodeManager::new(Arc::clone(&crd), opt.node_manager.clone())?;
        Ok(Self {
            inner: Arc::new(WorkerInner {
                node_manager,
                job_manager: JobManager::new(Arc::clone(&crd)),
                reporter: JobReporter::new(crd),
                running: RwLock::new(HashMap::new()),
                local_options: StdMutex::new(Arc::new(HashMap::new())),
                node: OnceLock::new(),
                opt,
            }),
            serve: Mutex::new(None),
        })
    }

    /// Set a worker-local option visible to every task context. Write-once
    /// semantics: call before `start`.
    pub fn set_local_option(&self, key: impl Into<String>, value: Value) {
        let mut options = self
            .inner
            .local_options
            .lock()
            .expect("options lock poisoned");
        let mut next = (**options).clone();
        next.insert(key.into(), value);
        *options = Arc::new(next);
    }

    /// The host registered for peers; `None` before `start`.
    pub fn advertised_host(&self) -> Option<String> {
        self.inner.node.get().map(|n| n.host.clone())
    }

    /// Look up a running executor by reference.
    pub async fn running_task(&self, reference: &TaskReference) -> Option<Arc<TaskExecutor>> {
        self.inner.get_running(&reference.to_string()).await
    }

    /// Abort a running task: cancel its context and drop it from the
    /// registry so no further stream can bind to it.
    pub async fn abort_task(&self, reference: &TaskReference) -> Result<()> {
        let exec = self
            .inner
            .running
            .write()
            .await
            .remove(&reference.to_string())
            .ok_or_else(|| MillError::NotFound(reference.to_string()))?;
        exec.cancel();
        Ok(())
    }

    /// Bind the listen socket, resolve the advertised host, register with
    /// the coordinator, and serve in the background.
    pub async fn start(&self) -> Result<()> {
        let mut serve = self.serve.lock().await;
        if serve.is_some() {
            return Err(MillError::Internal("worker already started".to_string()));
        }

        let listener = TcpListener::bind(&self.inner.opt.listen_host).await?;
        let local_addr = listener.local_addr()?;
        let mut advertised = self.inner.opt.advertised_host.clone();
        if advertised.ends_with(':') {
            // The port is assigned by the OS.
            advertised.push_str(&local_addr.port().to_string());
        }

        let mut node = Node::new(advertised.clone(), NodeType::Worker);
        node.tag = self.inner.opt.node_tags.clone();
        self.inner.node_manager.register_self(node.clone()).await?;
        let _ = self.inner.node.set(node);
        self.inner.reporter.start();

        let service = NodeServer::new(WorkerService {
            inner: Arc::clone(&self.inner),
        })
        .max_decoding_message_size(self.inner.opt.input.max_recv_size);
        let handle = tokio::spawn(async move {
            if let Err(e) = Server::builder()
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
            {
                warn!(error = %e, "worker server stopped");
            }
        });
        info!(listen = %local_addr, advertised = %advertised, "worker serving");
        *serve = Some(handle);
        Ok(())
    }

    /// Hard-stop the server, unregister the node, and close the node
    /// manager. Running executors finish on their own.
    pub async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.serve.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.inner.reporter.close().await;
        if let Some(node) = self.inner.node.get() {
            self.inner.node_manager.unregister(&node.id).await?;
        }
        self.inner.node_manager.close().await
    }
}

struct WorkerService {
    inner: Arc<WorkerInner>,
}

#[tonic::async_trait]
impl rowmill_rpc::Node for WorkerService {
    async fn create_tasks(
        &self,
        request: Request<v1::CreateTasksRequest>,
    ) -> std::result::Result<Response<v1::CreateTasksResponse>, Status> {
        let req = request.into_inner();
        let job: Job = serde_json::from_slice(&req.job_json)
            .map_err(|e| Status::invalid_argument(format!("invalid job JSON: {e}")))?;
        let stage: Stage = serde_json::from_slice(&req.stage_json)
            .map_err(|e| Status::invalid_argument(format!("invalid stage JSON: {e}")))?;
        let mut broadcasts = HashMap::new();
        for (key, raw) in &req.broadcasts {
            let value: Value = serde_json::from_slice(raw)
                .map_err(|e| Status::invalid_argument(format!("invalid broadcast {key}: {e}")))?;
            broadcasts.insert(key.clone(), value);
        }
        let broadcasts = Arc::new(broadcasts);
        let plan = req.output.unwrap_or_default();

        let creations = req.partition_ids.iter().map(|partition_id| {
            self.inner
                .create_task(&job, &stage, partition_id, &broadcasts, &plan)
        });
        let results = futures::future::join_all(creations).await;
        for result in results {
            result?;
        }

        info!(
            job_id = %job.id,
            stage = %stage.name,
            partitions = %req.partition_ids.join(","),
            "tasks created"
        );
        Ok(Response::new(v1::CreateTasksResponse {}))
    }

    async fn push_data(
        &self,
        request: Request<Streaming<v1::RowBatch>>,
    ) -> std::result::Result<Response<v1::PushDataResponse>, Status> {
        let header = DataHeader::from_metadata(request.metadata()).map_err(to_status)?;
        let task_id = header.task_id();
        let exec = self
            .inner
            .get_running(&task_id)
            .await
            .ok_or_else(|| Status::invalid_argument(format!("task not found: {task_id}")))?;

        let mut stream = request.into_inner();
        match exec.take_input_feed() {
            Some(feed) => {
                if let Err(e) = input::dispatch_push(feed, stream).await {
                    // Dump the header on stream failure for operator triage;
                    // the receiving executor goes down with the stream.
                    warn!(task = %task_id, from_host = %header.from_host, error = %e, "push stream failed");
                    exec.terminate(format!(
                        "push stream from {} failed: {e}",
                        header.from_host
                    ));
                    return Err(to_status(e));
                }
            }
            None if exec.state().is_terminal() => {
                // Late data for a finished task is discarded, the stream is
                // still acknowledged.
                let drained: Result<()> = async {
                    while let Some(_batch) =
                        stream.message().await.map_err(rowmill_rpc::from_status)?
                    {}
                    Ok(())
                }
                .await;
                if let Err(e) = drained {
                    warn!(task = %task_id, from_host = %header.from_host, error = %e, "push stream failed");
                    return Err(to_status(e));
                }
            }
            None => {
                return Err(Status::invalid_argument(format!(
                    "input already bound: {task_id}"
                )));
            }
        }

        exec.wait_for_finish().await;
        self.inner.remove_running(&task_id).await;
        Ok(Response::new(v1::PushDataResponse {}))
    }

    type PollDataStream =
        Pin<Box<dyn Stream<Item = std::result::Result<v1::RowBatch, Status>> + Send>>;

    async fn poll_data(
        &self,
        request: Request<v1::PollDataRequest>,
    ) -> std::result::Result<Response<Self::PollDataStream>, Status> {
        let header = DataHeader::from_metadata(request.metadata()).map_err(to_status)?;
        let task_id = header.task_id();
        let exec = self
            .inner
            .get_running(&task_id)
            .await
            .ok_or_else(|| Status::invalid_argument(format!("task not found: {task_id}")))?;
        let mut pull = exec.take_pull_output().ok_or_else(|| {
            Status::invalid_argument(format!("task has no pull output: {task_id}"))
        })?;

        let (tx, rx) = mpsc::channel(1);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(rows) = pull.recv().await {
                if tx.send(Ok(row_batch(rows))).await.is_err() {
                    break;
                }
            }
            // Dropping the receiver fails further producer writes once the
            // consumer hung up.
            drop(pull);
            exec.wait_for_finish().await;
            inner.remove_running(&task_id).await;
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
