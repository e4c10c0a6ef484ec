//! NDJSON channel over async byte streams
//!
//! Each frame is one line of JSON: `{"topic":"rpc","data":{...}}`. Used for
//! the stdio link between the gateway and its agent worker processes.

use super::{ChannelError, ChannelFrame, DuplexChannel, ObjectHandler, TopicHandlers};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

/// Longest accepted line (16 MB)
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

type LineWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LinesCodec>;

/// Duplex channel over a reader/writer pair
pub struct StreamChannel {
    writer: Mutex<LineWriter>,
    handlers: Arc<TopicHandlers>,
    closed: CancellationToken,
}

impl StreamChannel {
    /// Wrap `reader` and `writer`. A background task starts reading
    /// immediately, so this must be called inside a Tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let handlers = Arc::new(TopicHandlers::default());
        let closed = CancellationToken::new();

        let read_handlers = handlers.clone();
        let read_closed = closed.clone();
        tokio::spawn(async move {
            let mut lines =
                FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
            loop {
                tokio::select! {
                    _ = read_closed.cancelled() => break,
                    line = lines.next() => match line {
                        Some(Ok(line)) => {
                            if !line.trim().is_empty() {
                                read_handlers.dispatch_text(&line);
                            }
                        }
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            tracing::warn!("Dropping oversized line on stream channel");
                        }
                        Some(Err(LinesCodecError::Io(e))) => {
                            tracing::debug!("Stream channel read failed: {}", e);
                            break;
                        }
                        None => break,
                    },
                }
            }
            read_closed.cancel();
        });

        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            writer: Mutex::new(FramedWrite::new(writer, LinesCodec::new())),
            handlers,
            closed,
        }
    }

    /// Resolves once the read side reaches EOF or fails
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl DuplexChannel for StreamChannel {
    async fn send_object(&self, topic: &str, obj: Value) -> Result<(), ChannelError> {
        let line = ChannelFrame::new(topic, obj).encode()?;
        let mut writer = self.writer.lock().await;
        writer.send(line).await.map_err(|e| match e {
            LinesCodecError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                ChannelError::Closed
            }
            other => ChannelError::Transport(other.to_string()),
        })
    }

    fn receive_object(&self, topic: &str, handler: ObjectHandler) {
        self.handlers.add(topic, handler);
    }
}
