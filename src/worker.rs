//! Agent worker process
//!
//! Runs inside every agent child process. The orchestrator reaches it over
//! an NDJSON RPC link on stdin/stdout; logs go to stderr so they never mix
//! with protocol frames.

use crate::channel::{DuplexChannel, StreamChannel};
use crate::error::Result;
use crate::rpc::{Procedure, ProcedureError, RpcTransport};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const ENV_AGENT_ID: &str = "AGENTGATE_AGENT_ID";
pub const ENV_AGENT_NAME: &str = "AGENTGATE_AGENT_NAME";
pub const ENV_TRANSPORT_ROOM: &str = "AGENTGATE_TRANSPORT_ROOM";
pub const ENV_AGENT_SCOPE: &str = "AGENTGATE_AGENT_SCOPE";

/// Time given to the shutdown response to reach the parent
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(100);

/// Identity handed to the worker by the orchestrator
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub agent_id: String,
    pub name: String,
    pub transport_room: String,
    pub scope: Value,
}

impl WorkerOptions {
    /// Read the identity from the environment set by the orchestrator
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).unwrap_or_default();
        let scope = std::env::var(ENV_AGENT_SCOPE)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(Value::Null);
        Self {
            agent_id: var(ENV_AGENT_ID),
            name: var(ENV_AGENT_NAME),
            transport_room: var(ENV_TRANSPORT_ROOM),
            scope,
        }
    }
}

/// Output of the `info` procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub pid: u32,
    pub agent_id: String,
    pub name: String,
    pub transport_room: String,
    pub scope: Value,
    pub uptime_ms: u64,
}

/// Register `ping`, `info` and `shutdown` on `rpc`.
///
/// `shutdown` answers first and then cancels `shutdown_token`.
pub fn register_procedures(
    rpc: &RpcTransport,
    options: &WorkerOptions,
    shutdown_token: CancellationToken,
) -> Result<()> {
    rpc.try_register(Procedure::typed("ping", |_: ()| async move {
        Ok::<_, ProcedureError>("pong".to_string())
    })?)?;

    let started = Instant::now();
    let options = Arc::new(options.clone());
    rpc.try_register(Procedure::typed("info", move |_: ()| {
        let options = options.clone();
        async move {
            Ok::<_, ProcedureError>(WorkerInfo {
                pid: std::process::id(),
                agent_id: options.agent_id.clone(),
                name: options.name.clone(),
                transport_room: options.transport_room.clone(),
                scope: options.scope.clone(),
                uptime_ms: started.elapsed().as_millis() as u64,
            })
        }
    })?)?;

    rpc.try_register(Procedure::typed("shutdown", move |_: ()| {
        let token = shutdown_token.clone();
        async move {
            tracing::info!("Shutdown requested");
            tokio::spawn(async move {
                tokio::time::sleep(SHUTDOWN_FLUSH).await;
                token.cancel();
            });
            Ok::<_, ProcedureError>(())
        }
    })?)?;

    Ok(())
}

/// Serve RPC on stdin/stdout until stdin closes or `shutdown` is called
pub async fn run_worker(options: WorkerOptions) -> Result<()> {
    let channel = Arc::new(StreamChannel::new(tokio::io::stdin(), tokio::io::stdout()));
    let dyn_channel: Arc<dyn DuplexChannel> = channel.clone();
    let rpc = RpcTransport::new(dyn_channel);
    let shutdown = CancellationToken::new();
    register_procedures(&rpc, &options, shutdown.clone())?;

    tracing::info!(
        agent_id = %options.agent_id,
        name = %options.name,
        pid = std::process::id(),
        "Agent worker ready"
    );

    tokio::select! {
        _ = channel.closed() => tracing::info!("Parent closed stdin, exiting"),
        _ = shutdown.cancelled() => tracing::info!("Agent worker shutting down"),
    }
    Ok(())
}
