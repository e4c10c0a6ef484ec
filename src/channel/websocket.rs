//! WebSocket channel
//!
//! Frames are JSON text messages with the same `{topic, data}` shape as the
//! stream channel. Binary messages are decoded as UTF-8 JSON as well.

use super::{ChannelError, ChannelFrame, DuplexChannel, ObjectHandler, TopicHandlers};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// Duplex channel over an established WebSocket connection
pub struct WsChannel<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    handlers: Arc<TopicHandlers>,
    closed: CancellationToken,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Take ownership of `socket` and start reading. Must be called inside
    /// a Tokio runtime.
    pub fn new(socket: WebSocketStream<S>) -> Self {
        let (sink, mut stream) = socket.split();
        let handlers = Arc::new(TopicHandlers::default());
        let closed = CancellationToken::new();

        let read_handlers = handlers.clone();
        let read_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = read_closed.cancelled() => break,
                    message = stream.next() => message,
                };
                match message {
                    Some(Ok(Message::Text(text))) => read_handlers.dispatch_text(&text),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => read_handlers.dispatch_text(text),
                        Err(_) => tracing::warn!("Dropping non UTF-8 binary WebSocket frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket channel read failed: {}", e);
                        break;
                    }
                }
            }
            read_closed.cancel();
        });

        Self {
            sink: Mutex::new(sink),
            handlers,
            closed,
        }
    }

    /// Resolves once the peer closes the connection
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Send a close frame to the peer
    pub async fn close(&self) -> Result<(), ChannelError> {
        let mut sink = self.sink.lock().await;
        sink.close().await.map_err(map_ws_error)
    }
}

impl<S> Drop for WsChannel<S> {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

fn map_ws_error(err: WsError) -> ChannelError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ChannelError::Closed,
        other => ChannelError::Transport(other.to_string()),
    }
}

#[async_trait]
impl<S> DuplexChannel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send_object(&self, topic: &str, obj: Value) -> Result<(), ChannelError> {
        let text = ChannelFrame::new(topic, obj).encode()?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text)).await.map_err(map_ws_error)
    }

    fn receive_object(&self, topic: &str, handler: ObjectHandler) {
        self.handlers.add(topic, handler);
    }
}
