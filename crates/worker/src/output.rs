//! Output partitioning, per-destination buffering, and outbound streams.
//!
//! Contract:
//! - rows destined for the same partition are delivered in emission order;
//!   rows across partitions have no ordering guarantee;
//! - a buffered remote sink accumulates up to the configured batch size
//!   before flushing a framed batch; it also flushes on close;
//! - `close` is idempotent, flushes every sink, and forwards EOF;
//! - a sink error fails the owning task.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::async_trait;
use tonic::transport::Channel;
use tonic::Request;

use rowmill_common::{MillError, Result, Row};
use rowmill_job::{Emit, PartitionerSpec, Route};
use rowmill_rpc::{from_status, row_batch, v1, DataHeader, NodeClient};

/// One destination sink for a task's emitted rows.
#[async_trait]
pub trait Output: Send {
    /// Deliver a batch toward the destination, honouring back-pressure.
    async fn write(&mut self, rows: Vec<Row>) -> Result<()>;

    /// Flush buffered rows and forward EOF.
    async fn close(&mut self) -> Result<()>;
}

/// Partitions emitted rows across per-destination sinks.
pub struct Writer {
    partitioner: Option<PartitionerSpec>,
    sinks: Vec<Box<dyn Output>>,
    closed: bool,
}

impl Writer {
    /// Build a writer over a `partition id -> sink` table. Sinks are ordered
    /// by partition id so routing indices are stable.
    pub fn new(
        partitioner: Option<PartitionerSpec>,
        sinks: HashMap<String, Box<dyn Output>>,
    ) -> Self {
        let mut entries: Vec<_> = sinks.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            partitioner,
            sinks: entries.into_iter().map(|(_, sink)| sink).collect(),
            closed: false,
        }
    }

    /// Number of destinations.
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Partition a batch across destinations. With no partitioner the rows
    /// target the sole sink, or broadcast when several destinations exist.
    pub async fn write(&mut self, rows: Vec<Row>) -> Result<()> {
        if self.closed {
            return Err(MillError::Internal("write to closed output".to_string()));
        }
        match self.sinks.len() {
            0 => Ok(()),
            1 => self.sinks[0].write(rows).await,
            n => match &self.partitioner {
                Some(PartitionerSpec::Broadcast) | None => {
                    for sink in &mut self.sinks {
                        sink.write(rows.clone()).await?;
                    }
                    Ok(())
                }
                Some(spec) => {
                    let mut grouped: Vec<Vec<Row>> = vec![Vec::new(); n];
                    for row in rows {
                        match spec.route(&row.key, n) {
                            Route::To(index) => grouped[index].push(row),
                            Route::All => {
                                for group in &mut grouped {
                                    group.push(row.clone());
                                }
                            }
                        }
                    }
                    for (index, group) in grouped.into_iter().enumerate() {
                        if !group.is_empty() {
                            self.sinks[index].write(group).await?;
                        }
                    }
                    Ok(())
                }
            },
        }
    }

    /// Flush and close every sink. Idempotent; returns the first error.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.close().await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Emit for Writer {
    async fn emit(&mut self, row: Row) -> Result<()> {
        self.write(vec![row]).await
    }
}

/// Accumulates rows per destination and flushes framed batches.
pub struct BufferedOutput {
    inner: Box<dyn Output>,
    buffer: Vec<Row>,
    capacity: usize,
}

impl BufferedOutput {
    /// Wrap a sink, flushing every `capacity` rows.
    pub fn new(inner: Box<dyn Output>, capacity: usize) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl Output for BufferedOutput {
    async fn write(&mut self, rows: Vec<Row>) -> Result<()> {
        self.buffer.extend(rows);
        while self.buffer.len() >= self.capacity {
            let batch: Vec<Row> = self.buffer.drain(..self.capacity).collect();
            self.inner.write(batch).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            let batch: Vec<Row> = self.buffer.drain(..).collect();
            self.inner.write(batch).await?;
        }
        self.inner.close().await
    }
}

/// Outbound push stream to a peer worker's task input.
///
/// Closing half-closes the request stream and then waits for the peer's
/// acknowledgement, which arrives only after the receiving executor reached
/// a terminal state.
pub struct PushStream {
    tx: Option<mpsc::Sender<v1::RowBatch>>,
    call: Option<JoinHandle<Result<()>>>,
}

impl PushStream {
    /// Open a push stream over an established channel, sending the data
    /// header as stream metadata.
    pub fn open(channel: Channel, header: &DataHeader) -> Result<Self> {
        let mut client = NodeClient::new(channel);
        let (tx, rx) = mpsc::channel(1);
        let mut request = Request::new(ReceiverStream::new(rx));
        header.apply(request.metadata_mut())?;
        let call = tokio::spawn(async move {
            client
                .push_data(request)
                .await
                .map(|_| ())
                .map_err(from_status)
        });
        Ok(Self {
            tx: Some(tx),
            call: Some(call),
        })
    }

    /// Surface the call's terminal status after the request stream broke.
    async fn stream_error(&mut self) -> MillError {
        self.tx = None;
        match self.call.take() {
            Some(handle) => match handle.await {
                Ok(Ok(())) => MillError::Internal("push stream closed before EOF".to_string()),
                Ok(Err(e)) => e,
                Err(e) => MillError::Internal(format!("push stream join: {e}")),
            },
            None => MillError::Internal("push stream already closed".to_string()),
        }
    }
}

#[async_trait]
impl Output for PushStream {
    async fn write(&mut self, rows: Vec<Row>) -> Result<()> {
        if let Some(tx) = &self.tx {
            if tx.send(row_batch(rows)).await.is_ok() {
                return Ok(());
            }
        }
        Err(self.stream_error().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        match self.call.take() {
            Some(handle) => handle
                .await
                .map_err(|e| MillError::Internal(format!("push stream join: {e}")))?,
            None => Ok(()),
        }
    }
}

/// Build a pull-mode sink: rows buffer in a bounded queue until a PollData
/// consumer drains them.
pub fn pull_queue(capacity: usize) -> (PullQueue, mpsc::Receiver<Vec<Row>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PullQueue { tx: Some(tx) }, rx)
}

/// Sink side of a consumer-driven output.
pub struct PullQueue {
    tx: Option<mpsc::Sender<Vec<Row>>>,
}

#[async_trait]
impl Output for PullQueue {
    async fn write(&mut self, rows: Vec<Row>) -> Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(rows)
                .await
                .map_err(|_| MillError::Internal("pull consumer went away".to_string())),
            None => Err(MillError::Internal("write to closed output".to_string())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records writes per destination for assertions.
    #[derive(Clone, Default)]
    struct VecSink {
        batches: Arc<Mutex<Vec<Vec<Row>>>>,
        closes: Arc<Mutex<usize>>,
    }

    impl VecSink {
        fn keys(&self) -> Vec<String> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .map(|r| r.key.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Output for VecSink {
        async fn write(&mut self, rows: Vec<Row>) -> Result<()> {
            self.batches.lock().unwrap().push(rows);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            *self.closes.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn rows(keys: &[&str]) -> Vec<Row> {
        keys.iter().map(|k| Row::new(*k, vec![])).collect()
    }

    #[tokio::test]
    async fn finite_key_routing_preserves_per_destination_order() {
        let p0 = VecSink::default();
        let p1 = VecSink::default();
        let sinks: HashMap<String, Box<dyn Output>> = HashMap::from([
            ("0".to_string(), Box::new(p0.clone()) as Box<dyn Output>),
            ("1".to_string(), Box::new(p1.clone()) as Box<dyn Output>),
        ]);
        let mut writer = Writer::new(
            Some(PartitionerSpec::FiniteKey {
                keys: vec!["0".to_string(), "1".to_string()],
            }),
            sinks,
        );

        writer.write(rows(&["0", "1", "0", "1", "0"])).await.expect("write");
        writer.close().await.expect("close");

        assert_eq!(p0.keys(), vec!["0", "0", "0"]);
        assert_eq!(p1.keys(), vec!["1", "1"]);
    }

    #[tokio::test]
    async fn absent_partitioner_broadcasts_across_many_sinks() {
        let a = VecSink::default();
        let b = VecSink::default();
        let sinks: HashMap<String, Box<dyn Output>> = HashMap::from([
            ("0".to_string(), Box::new(a.clone()) as Box<dyn Output>),
            ("1".to_string(), Box::new(b.clone()) as Box<dyn Output>),
        ]);
        let mut writer = Writer::new(None, sinks);
        writer.write(rows(&["x", "y"])).await.expect("write");
        assert_eq!(a.keys(), vec!["x", "y"]);
        assert_eq!(b.keys(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn absent_partitioner_targets_single_sink() {
        let only = VecSink::default();
        let sinks: HashMap<String, Box<dyn Output>> = HashMap::from([(
            "0".to_string(),
            Box::new(only.clone()) as Box<dyn Output>,
        )]);
        let mut writer = Writer::new(None, sinks);
        writer.write(rows(&["x", "y", "z"])).await.expect("write");
        assert_eq!(only.keys(), vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let sink = VecSink::default();
        let sinks: HashMap<String, Box<dyn Output>> = HashMap::from([(
            "0".to_string(),
            Box::new(sink.clone()) as Box<dyn Output>,
        )]);
        let mut writer = Writer::new(None, sinks);
        writer.close().await.expect("close");
        writer.close().await.expect("close again");
        assert_eq!(*sink.closes.lock().unwrap(), 1);
        assert!(writer.write(rows(&["x"])).await.is_err());
    }

    #[tokio::test]
    async fn buffered_output_flushes_at_capacity_and_on_close() {
        let sink = VecSink::default();
        let mut buffered = BufferedOutput::new(Box::new(sink.clone()), 2);

        buffered.write(rows(&["a"])).await.expect("write");
        assert!(sink.keys().is_empty());
        buffered.write(rows(&["b", "c"])).await.expect("write");
        assert_eq!(sink.keys(), vec!["a", "b"]);

        buffered.close().await.expect("close");
        assert_eq!(sink.keys(), vec!["a", "b", "c"]);
        assert_eq!(*sink.closes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn pull_queue_delivers_until_closed() {
        let (mut queue, mut rx) = pull_queue(4);
        queue.write(rows(&["a"])).await.expect("write");
        queue.close().await.expect("close");

        assert_eq!(rx.recv().await.expect("batch")[0].key, "a");
        assert!(rx.recv().await.is_none());
    }
}
