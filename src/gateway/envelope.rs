//! Request envelope parsing

use super::error::{ApiError, OperationResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw request payload as received from a transport
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

/// Stream subscription action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamAction {
    Subscribe,
    Unsubscribe,
}

impl StreamAction {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamAction::Subscribe => "subscribe",
            StreamAction::Unsubscribe => "unsubscribe",
        }
    }
}

/// Base request shape shared by every handler
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub handler_id: String,
    #[serde(default)]
    pub server_token: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    /// Echoed in WebSocket replies for correlation
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub action: Option<StreamAction>,
}

impl Envelope {
    /// Decode and check the base shape
    pub fn parse(payload: &Payload) -> OperationResult<Self> {
        let text = match payload {
            Payload::Text(text) => text,
            Payload::Binary(_) => {
                return Err(ApiError::validation("Request payload must be text"));
            }
        };

        let value: Value = serde_json::from_str(text)
            .map_err(|e| ApiError::validation(format!("Invalid JSON: {}", e)))?;
        if !value.is_object() {
            return Err(ApiError::validation("Request must be a JSON object"));
        }

        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| ApiError::validation(format!("Invalid request envelope: {}", e)))?;
        if envelope.handler_id.is_empty() {
            return Err(ApiError::validation("handlerId must not be empty"));
        }
        Ok(envelope)
    }

    /// Subscription id and action of a stream request
    pub fn stream_fields(&self) -> OperationResult<(String, StreamAction)> {
        let subscription_id = match self.subscription_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(ApiError::validation("Stream requests require subscriptionId")),
        };
        let action = self
            .action
            .ok_or_else(|| ApiError::validation("Stream requests require action"))?;
        Ok((subscription_id, action))
    }
}
