//! Zero-copy in-process handoff between co-located tasks.
//!
//! When a producer and consumer are scheduled on the same worker, the
//! producer's sink enqueues straight into the consumer's input reader and
//! no row payload crosses the RPC layer. The pipe holds the input feed
//! capability, not the reader: closing forwards EOF and nothing else.

use tonic::async_trait;

use rowmill_common::{Result, Row};

use crate::input::Feed;
use crate::output::Output;

/// In-process sink into a co-located executor's input reader.
pub struct LocalPipe {
    feed: Option<Feed>,
}

impl LocalPipe {
    /// Wrap the consumer's input feed.
    pub fn new(feed: Feed) -> Self {
        Self { feed: Some(feed) }
    }
}

#[async_trait]
impl Output for LocalPipe {
    async fn write(&mut self, rows: Vec<Row>) -> Result<()> {
        if let Some(feed) = &self.feed {
            // A terminal consumer discards late rows, matching push-stream
            // semantics.
            feed.push(rows).await;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.feed = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input;
    use futures::StreamExt;

    #[tokio::test]
    async fn pipe_forwards_rows_and_eof() {
        let (feed, reader) = input::channel(4);
        let mut pipe = LocalPipe::new(feed);

        pipe.write(vec![Row::new("a", vec![]), Row::new("b", vec![])])
            .await
            .expect("write");
        pipe.close().await.expect("close");
        pipe.close().await.expect("close is idempotent");

        let keys: Vec<String> = reader.into_stream().map(|r| r.key).collect().await;
        assert_eq!(keys, vec!["a", "b"]);
    }
}
