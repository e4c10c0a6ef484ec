//! In-process channel pair

use super::{ChannelError, ChannelFrame, DuplexChannel, ObjectHandler, TopicHandlers};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One end of an in-process duplex pipe.
///
/// Objects sent on one end are delivered, in order, to the handlers
/// registered on the other end. Dropping an end closes the pipe.
pub struct MemoryChannel {
    outbound: mpsc::UnboundedSender<ChannelFrame>,
    handlers: Arc<TopicHandlers>,
    shutdown: CancellationToken,
}

impl MemoryChannel {
    /// Create two connected ends. Must be called inside a Tokio runtime.
    pub fn pair() -> (Self, Self) {
        let (to_right, from_left) = mpsc::unbounded_channel();
        let (to_left, from_right) = mpsc::unbounded_channel();
        (Self::spawn(to_right, from_right), Self::spawn(to_left, from_left))
    }

    fn spawn(
        outbound: mpsc::UnboundedSender<ChannelFrame>,
        mut inbound: mpsc::UnboundedReceiver<ChannelFrame>,
    ) -> Self {
        let handlers = Arc::new(TopicHandlers::default());
        let shutdown = CancellationToken::new();

        let pump_handlers = handlers.clone();
        let pump_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_shutdown.cancelled() => break,
                    frame = inbound.recv() => match frame {
                        Some(frame) => pump_handlers.dispatch(frame),
                        None => break,
                    },
                }
            }
        });

        Self {
            outbound,
            handlers,
            shutdown,
        }
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl DuplexChannel for MemoryChannel {
    async fn send_object(&self, topic: &str, obj: Value) -> Result<(), ChannelError> {
        self.outbound
            .send(ChannelFrame::new(topic, obj))
            .map_err(|_| ChannelError::Closed)
    }

    fn receive_object(&self, topic: &str, handler: ObjectHandler) {
        self.handlers.add(topic, handler);
    }
}
