//! Agent process records and orchestrator payloads

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Process state
// =============================================================================

/// Lifecycle state of an agent process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AgentProcessStatus {
    /// No child process
    Stopped,
    /// Child spawned, waiting for its first ping
    Starting,
    /// Child answered its readiness probe
    Running,
    /// Shutdown requested
    Stopping,
}

/// Public view of one managed agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentProcessInfo {
    pub id: String,
    pub name: String,
    /// Opaque scope passed at start
    pub scope: Value,
    pub status: AgentProcessStatus,
    pub pid: Option<u32>,
    pub created_at: u64,
    pub last_started_at: Option<u64>,
    pub last_seen_at: Option<u64>,
    pub restart_count: u32,
    pub exit_code: Option<i32>,
    /// CPU usage in percent of one core
    pub cpu: f64,
    /// Resident memory in bytes
    pub memory: u64,
}

impl AgentProcessInfo {
    pub(crate) fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            scope: Value::Null,
            status: AgentProcessStatus::Stopped,
            pid: None,
            created_at: now_millis(),
            last_started_at: None,
            last_seen_at: None,
            restart_count: 0,
            exit_code: None,
            cpu: 0.0,
            memory: 0,
        }
    }
}

/// Lifecycle notification broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub agent_id: String,
    pub status: AgentProcessStatus,
    pub restart_count: u32,
    pub at: u64,
}

// =============================================================================
// Operation payloads
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentInput {
    /// Requested id (generated when absent)
    #[serde(default)]
    #[schemars(length(min = 1, max = 128))]
    pub id: Option<String>,
    #[schemars(length(min = 1, max = 256))]
    pub name: String,
}

/// How a client reaches the created agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub agent_id: String,
    pub name: String,
    /// Transport kind between gateway and agent
    pub transport: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentOutput {
    pub id: String,
    pub client_config: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartAgentInput {
    #[schemars(length(min = 1))]
    pub id: String,
    #[serde(default)]
    pub scope: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartAgentOutput {
    pub session_token: String,
    pub transport_room: String,
}

/// Agent id plus the session token returned by `start`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInput {
    #[schemars(length(min = 1))]
    pub id: String,
    #[schemars(length(min = 1))]
    pub session_token: String,
}

/// Current time in milliseconds since UNIX epoch
pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_now_millis() {
        assert!(now_millis() > 1_700_000_000_000);
    }

    #[test]
    fn test_info_serializes_camel_case() {
        let info = AgentProcessInfo::new("a1".to_string(), "alpha".to_string());
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["status"], json!("stopped"));
        assert_eq!(value["restartCount"], json!(0));
        assert!(value["lastStartedAt"].is_null());
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn test_session_input_requires_token() {
        let parsed = serde_json::from_value::<SessionInput>(json!({"id": "a1"}));
        assert!(parsed.is_err());

        let parsed: SessionInput =
            serde_json::from_value(json!({"id": "a1", "sessionToken": "t"})).unwrap();
        assert_eq!(parsed.session_token, "t");
    }

    #[test]
    fn test_start_input_scope_defaults_to_null() {
        let parsed: StartAgentInput = serde_json::from_value(json!({"id": "a1"})).unwrap();
        assert!(parsed.scope.is_null());
    }
}
