//! Bounded input queue feeding one task, plus the inbound push source.
//!
//! Contract:
//! - the executor owns the [`Reader`]; inbound stream handlers and local
//!   pipes hold a [`Feed`] capability (enqueue + close), never the reader;
//! - exactly one producer feeds a task at a time; dropping the sole feed
//!   is EOF;
//! - enqueueing suspends while the queue is full, chaining back-pressure
//!   to the producer.

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Streaming;

use rowmill_common::{Result, Row};
use rowmill_rpc::{from_row_batch, from_status, v1};

/// Build a bounded input queue of `queue_length` row batches.
pub fn channel(queue_length: usize) -> (Feed, Reader) {
    let (tx, rx) = mpsc::channel(queue_length.max(1));
    (Feed { tx }, Reader { rx })
}

/// Enqueue-and-close capability held by a task's sole inbound producer.
pub struct Feed {
    tx: mpsc::Sender<Vec<Row>>,
}

impl Feed {
    /// Enqueue a batch, suspending while the queue is full. Returns `false`
    /// when the consumer is gone and the batch was discarded.
    pub async fn push(&self, rows: Vec<Row>) -> bool {
        self.tx.send(rows).await.is_ok()
    }
}

/// Bounded queue of inbound row batches, owned by the task executor.
pub struct Reader {
    rx: mpsc::Receiver<Vec<Row>>,
}

impl Reader {
    /// The lazy finite row sequence consumed by the user function. Ends when
    /// the producer's feed is dropped.
    pub fn into_stream(self) -> impl Stream<Item = Row> + Send {
        ReceiverStream::new(self.rx).flat_map(stream::iter)
    }
}

/// Drain an inbound push stream into a task's input. The next frame is not
/// read until the queue accepts the previous one; frames arriving after the
/// consumer finished are discarded.
pub async fn dispatch_push(feed: Feed, mut stream: Streaming<v1::RowBatch>) -> Result<()> {
    while let Some(batch) = stream.message().await.map_err(from_status)? {
        feed.push(from_row_batch(batch)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn rows_flatten_in_order_and_close_is_eof() {
        let (feed, reader) = channel(4);
        assert!(feed.push(vec![Row::new("a", vec![]), Row::new("b", vec![])]).await);
        assert!(feed.push(vec![Row::new("c", vec![])]).await);
        drop(feed);

        let keys: Vec<String> = reader.into_stream().map(|r| r.key).collect().await;
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn full_queue_blocks_producer_without_dropping_rows() {
        let (feed, reader) = channel(1);
        assert!(feed.push(vec![Row::new("a", vec![])]).await);

        // The queue is full: the next push must suspend, not drop.
        let second = feed.push(vec![Row::new("b", vec![])]);
        tokio::pin!(second);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), second.as_mut())
                .await
                .is_err()
        );

        let mut rows = reader.into_stream();
        assert_eq!(rows.next().await.expect("row").key, "a");
        assert!(second.await);
        assert_eq!(rows.next().await.expect("row").key, "b");
    }

    #[tokio::test]
    async fn push_after_consumer_drop_discards() {
        let (feed, reader) = channel(1);
        drop(reader);
        assert!(!feed.push(vec![Row::new("a", vec![])]).await);
    }
}
