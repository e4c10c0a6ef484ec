//! Handler table
//!
//! Every handler the gateway serves is a variant of [`HandlerId`]. The wire
//! names and the compiled table are generated from the enum, so there is no
//! separate hand-maintained list to fall out of sync.

use super::error::{ApiError, OperationResult};
use crate::error::{Error, Result};
use crate::orchestrator::{
    AgentEvent, AgentProcessInfo, CreateAgentInput, CreateAgentOutput, SessionInput,
    StartAgentInput, StartAgentOutput,
};
use crate::rpc::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// How a handler is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Request/response
    Call,
    /// Fire-and-forget
    Cast,
    /// Subscription with pushed updates
    Stream,
}

/// Every handler served by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerId {
    ServerPing,
    ServerInfo,
    ServerProcesses,
    ServerInfoStream,
    ServerProcessesStream,
    ServerEventsStream,
    AgentCreate,
    AgentStart,
    AgentStop,
    AgentPing,
    AgentInfo,
    AgentInfoStream,
    AgentHeartbeat,
}

type SchemaFn = fn() -> Result<Schema>;

/// Static description of a handler
#[derive(Debug, Clone, Copy)]
pub struct HandlerDefinition {
    pub kind: HandlerKind,
    /// Requires the server token
    pub protected: bool,
    pub input: Option<SchemaFn>,
    pub output: Option<SchemaFn>,
    /// Overrides the gateway default timeout
    pub timeout: Option<Duration>,
}

fn schema<T: JsonSchema>() -> Option<SchemaFn> {
    let compile: SchemaFn = Schema::of::<T>;
    Some(compile)
}

/// Timeout of handlers that spawn or stop processes
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);

impl HandlerId {
    pub const ALL: [HandlerId; 13] = [
        HandlerId::ServerPing,
        HandlerId::ServerInfo,
        HandlerId::ServerProcesses,
        HandlerId::ServerInfoStream,
        HandlerId::ServerProcessesStream,
        HandlerId::ServerEventsStream,
        HandlerId::AgentCreate,
        HandlerId::AgentStart,
        HandlerId::AgentStop,
        HandlerId::AgentPing,
        HandlerId::AgentInfo,
        HandlerId::AgentInfoStream,
        HandlerId::AgentHeartbeat,
    ];

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerId::ServerPing => "server.ping",
            HandlerId::ServerInfo => "server.info",
            HandlerId::ServerProcesses => "server.processes",
            HandlerId::ServerInfoStream => "server.info-stream",
            HandlerId::ServerProcessesStream => "server.processes-stream",
            HandlerId::ServerEventsStream => "server.events-stream",
            HandlerId::AgentCreate => "agent.create",
            HandlerId::AgentStart => "agent.start",
            HandlerId::AgentStop => "agent.stop",
            HandlerId::AgentPing => "agent.ping",
            HandlerId::AgentInfo => "agent.info",
            HandlerId::AgentInfoStream => "agent.info-stream",
            HandlerId::AgentHeartbeat => "agent.heartbeat",
        }
    }

    pub fn definition(self) -> HandlerDefinition {
        use HandlerKind::{Call, Cast, Stream};

        let (kind, protected, input, output, timeout): (
            HandlerKind,
            bool,
            Option<SchemaFn>,
            Option<SchemaFn>,
            Option<Duration>,
        ) = match self {
            HandlerId::ServerPing => (Call, true, None, schema::<String>(), None),
            HandlerId::ServerInfo => (Call, true, None, schema::<ServerInfo>(), None),
            HandlerId::ServerProcesses => (
                Call,
                true,
                None,
                schema::<Vec<AgentProcessInfo>>(),
                None,
            ),
            HandlerId::ServerInfoStream => (
                Stream,
                true,
                schema::<PollingInput>(),
                schema::<ServerInfo>(),
                None,
            ),
            HandlerId::ServerProcessesStream => (
                Stream,
                true,
                schema::<PollingInput>(),
                schema::<Vec<AgentProcessInfo>>(),
                None,
            ),
            HandlerId::ServerEventsStream => {
                (Stream, true, None, schema::<AgentEvent>(), None)
            }
            HandlerId::AgentCreate => (
                Call,
                false,
                schema::<CreateAgentInput>(),
                schema::<CreateAgentOutput>(),
                None,
            ),
            HandlerId::AgentStart => (
                Call,
                false,
                schema::<StartAgentInput>(),
                schema::<StartAgentOutput>(),
                Some(LIFECYCLE_TIMEOUT),
            ),
            HandlerId::AgentStop => (
                Call,
                false,
                schema::<SessionInput>(),
                schema::<()>(),
                Some(LIFECYCLE_TIMEOUT),
            ),
            HandlerId::AgentPing => (
                Call,
                false,
                schema::<SessionInput>(),
                schema::<String>(),
                None,
            ),
            HandlerId::AgentInfo => (
                Call,
                false,
                schema::<SessionInput>(),
                schema::<AgentProcessInfo>(),
                None,
            ),
            HandlerId::AgentInfoStream => (
                Stream,
                false,
                schema::<AgentInfoStreamInput>(),
                schema::<AgentProcessInfo>(),
                None,
            ),
            HandlerId::AgentHeartbeat => {
                (Cast, false, schema::<SessionInput>(), None, None)
            }
        };

        HandlerDefinition {
            kind,
            protected,
            input,
            output,
            timeout,
        }
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        HandlerId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| Error::NotFound(format!("Unknown handler '{}'", s)))
    }
}

// =============================================================================
// Handler payloads
// =============================================================================

/// Input of the timer driven server streams
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PollingInput {
    /// Push interval (1000 to 30000 ms, default 2000)
    #[serde(default)]
    #[schemars(range(min = 1000, max = 30000))]
    pub interval_ms: Option<u64>,
}

/// Input of `agent.info-stream`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfoStreamInput {
    #[schemars(length(min = 1))]
    pub id: String,
    #[schemars(length(min = 1))]
    pub session_token: String,
    #[serde(default)]
    #[schemars(range(min = 1000, max = 30000))]
    pub interval_ms: Option<u64>,
}

/// Output of `server.info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: String,
    pub pid: u32,
    pub uptime_ms: u64,
    /// Managed agents
    pub agents: usize,
    /// Agents currently running
    pub running: usize,
    /// Gateway CPU usage in percent
    pub cpu: f64,
    /// Gateway resident memory in bytes
    pub memory: u64,
}

// =============================================================================
// Compiled table
// =============================================================================

/// A handler definition with its schemas compiled
#[derive(Debug, Clone)]
pub struct CompiledHandler {
    pub id: HandlerId,
    pub kind: HandlerKind,
    pub protected: bool,
    pub input: Option<Schema>,
    pub output: Option<Schema>,
    pub timeout: Option<Duration>,
}

/// Wire name → compiled handler
#[derive(Debug)]
pub struct HandlerTable {
    handlers: HashMap<&'static str, CompiledHandler>,
}

impl HandlerTable {
    /// Compile every handler's schemas
    pub fn compile() -> Result<Self> {
        let mut handlers = HashMap::with_capacity(HandlerId::ALL.len());
        for id in HandlerId::ALL {
            let definition = id.definition();
            let input = definition.input.map(|f| f()).transpose()?;
            let output = definition.output.map(|f| f()).transpose()?;
            handlers.insert(
                id.as_str(),
                CompiledHandler {
                    id,
                    kind: definition.kind,
                    protected: definition.protected,
                    input,
                    output,
                    timeout: definition.timeout,
                },
            );
        }
        Ok(Self { handlers })
    }

    /// Look up a handler by wire name
    pub fn resolve(&self, handler_id: &str) -> OperationResult<&CompiledHandler> {
        self.handlers
            .get(handler_id)
            .ok_or_else(|| ApiError::validation(format!("Handler '{}' not found", handler_id)))
    }

    pub fn get(&self, id: HandlerId) -> Option<&CompiledHandler> {
        self.handlers.get(id.as_str())
    }

    /// Handlers of a given kind
    pub fn of_kind(&self, kind: HandlerKind) -> impl Iterator<Item = &CompiledHandler> {
        self.handlers.values().filter(move |h| h.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names_round_trip() {
        for id in HandlerId::ALL {
            assert_eq!(id.as_str().parse::<HandlerId>().unwrap(), id);
        }
        assert!("server.nope".parse::<HandlerId>().is_err());
    }

    #[test]
    fn test_wire_names_unique() {
        let mut names: Vec<&str> = HandlerId::ALL.iter().map(|id| id.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), HandlerId::ALL.len());
    }

    #[test]
    fn test_table_compiles() {
        let table = HandlerTable::compile().unwrap();
        for id in HandlerId::ALL {
            assert_eq!(table.get(id).unwrap().id, id);
        }
        let streams: Vec<HandlerId> = table.of_kind(HandlerKind::Stream).map(|h| h.id).collect();
        assert_eq!(streams.len(), 4);
        assert!(streams.contains(&HandlerId::AgentInfoStream));
    }

    #[test]
    fn test_resolve_unknown_is_validation() {
        let table = HandlerTable::compile().unwrap();
        let err = table.resolve("agent.nope").unwrap_err();
        assert_eq!(err.code, super::super::error::ErrorCode::Validation);
    }

    #[test]
    fn test_server_handlers_are_protected() {
        for id in HandlerId::ALL {
            let definition = id.definition();
            assert_eq!(definition.protected, id.as_str().starts_with("server."));
        }
    }

    #[test]
    fn test_lifecycle_timeouts() {
        assert_eq!(HandlerId::AgentStart.definition().timeout, Some(LIFECYCLE_TIMEOUT));
        assert_eq!(HandlerId::AgentStop.definition().timeout, Some(LIFECYCLE_TIMEOUT));
        assert_eq!(HandlerId::AgentPing.definition().timeout, None);
    }

    #[test]
    fn test_polling_interval_bounds() {
        let table = HandlerTable::compile().unwrap();
        let input = table.get(HandlerId::ServerInfoStream).unwrap().input.clone().unwrap();
        assert!(input.validate(&json!({})).is_ok());
        assert!(input.validate(&json!({"intervalMs": 5000})).is_ok());
        assert!(input.validate(&json!({"intervalMs": 10})).is_err());
        assert!(input.validate(&json!({"intervalMs": 60000})).is_err());
    }

    #[test]
    fn test_create_input_schema() {
        let table = HandlerTable::compile().unwrap();
        let input = table.get(HandlerId::AgentCreate).unwrap().input.clone().unwrap();
        assert!(input.validate(&json!({"name": "alpha"})).is_ok());
        assert!(input.validate(&json!({"id": "a1", "name": "alpha"})).is_ok());
        assert!(input.validate(&json!({})).is_err());
        assert!(input.validate(&json!({"name": ""})).is_err());
    }
}
