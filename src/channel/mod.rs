//! Duplex object channels
//!
//! A channel moves JSON objects tagged with a topic between two peers. The
//! RPC layer is built on top of this contract and never touches sockets or
//! pipes directly.
//!
//! | Implementation    | Transport                                   |
//! |-------------------|---------------------------------------------|
//! | [`MemoryChannel`] | in-process pipe (tests, embedded agents)    |
//! | [`StreamChannel`] | NDJSON over any async byte stream (stdio)   |
//! | [`WsChannel`]     | text frames over a WebSocket stream         |

mod memory;
mod stream;
mod websocket;

pub use memory::MemoryChannel;
pub use stream::StreamChannel;
pub use websocket::WsChannel;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Callback invoked for every inbound object on a topic
pub type ObjectHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Channel failure
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The remote end is gone
    #[error("channel closed")]
    Closed,

    /// The object could not be encoded
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// The underlying transport failed
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<ChannelError> for crate::Error {
    fn from(err: ChannelError) -> Self {
        crate::Error::Channel(err.to_string())
    }
}

/// Bidirectional, topic-tagged object transport.
///
/// Delivery is FIFO per connection and fire-and-forget: a successful
/// `send_object` only means the object was handed to the transport.
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    /// Serialize and transmit `obj` tagged with `topic`
    async fn send_object(&self, topic: &str, obj: Value) -> Result<(), ChannelError>;

    /// Register a handler for every inbound object tagged `topic`
    fn receive_object(&self, topic: &str, handler: ObjectHandler);
}

/// Wire frame used by the byte and text transports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub topic: String,
    #[serde(default)]
    pub data: Value,
}

impl ChannelFrame {
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            data,
        }
    }

    /// Encode as a single line of JSON
    pub fn encode(&self) -> Result<String, ChannelError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Topic → handlers table shared by every channel implementation
#[derive(Default)]
pub(crate) struct TopicHandlers {
    handlers: RwLock<HashMap<String, Vec<ObjectHandler>>>,
}

impl TopicHandlers {
    pub(crate) fn add(&self, topic: &str, handler: ObjectHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(handler);
    }

    /// Invoke every handler registered for the frame's topic
    pub(crate) fn dispatch(&self, frame: ChannelFrame) {
        let handlers: Vec<ObjectHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&frame.topic)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::debug!(topic = %frame.topic, "Dropping frame for topic without handler");
            return;
        }

        let last = handlers.len() - 1;
        let mut data = Some(frame.data);
        for (index, handler) in handlers.iter().enumerate() {
            let value = if index == last {
                data.take().unwrap_or(Value::Null)
            } else {
                data.clone().unwrap_or(Value::Null)
            };
            handler(value);
        }
    }

    /// Decode one text frame and dispatch it; malformed frames are dropped
    pub(crate) fn dispatch_text(&self, text: &str) {
        match serde_json::from_str::<ChannelFrame>(text) {
            Ok(frame) => self.dispatch(frame),
            Err(e) => {
                let preview = &text[..floor_char_boundary(text, 200)];
                tracing::warn!("Dropping malformed channel frame: {} (raw: {})", e, preview);
            }
        }
    }
}

fn floor_char_boundary(text: &str, max: usize) -> usize {
    if text.len() <= max {
        return text.len();
    }
    let mut index = max;
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
