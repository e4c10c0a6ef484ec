//! Agent process lifecycle management
//!
//! Spawns one worker process per started agent, talks to it over RPC on its
//! stdin/stdout, and relaunches it after unexpected exits.

use super::telemetry::UsageSampler;
use super::types::{
    now_millis, AgentEvent, AgentProcessInfo, AgentProcessStatus, ClientConfig, CreateAgentInput,
    CreateAgentOutput, SessionInput, StartAgentInput, StartAgentOutput,
};
use super::AgentOrchestrator;
use crate::channel::{DuplexChannel, StreamChannel};
use crate::config::AgentsConfig;
use crate::error::{Error, Result};
use crate::rpc::RpcTransport;
use crate::token::{constant_time_eq, generate_token};
use crate::worker::{ENV_AGENT_ID, ENV_AGENT_NAME, ENV_AGENT_SCOPE, ENV_TRANSPORT_ROOM};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle event buffer per subscriber
const EVENT_CAPACITY: usize = 256;

/// Per-attempt budget of the readiness ping
const READY_PROBE_ATTEMPT: Duration = Duration::from_millis(500);

/// Pause between readiness attempts
const READY_PROBE_BACKOFF: Duration = Duration::from_millis(100);

impl AgentProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentProcessStatus::Stopped => "stopped",
            AgentProcessStatus::Starting => "starting",
            AgentProcessStatus::Running => "running",
            AgentProcessStatus::Stopping => "stopping",
        }
    }
}

/// Handles to a live child process
#[derive(Clone)]
struct ProcessHandle {
    rpc: Arc<RpcTransport>,
    /// Cancel to force-kill the child
    kill: CancellationToken,
    /// Cancelled by the exit monitor once the child is reaped
    exited: CancellationToken,
}

struct AgentEntry {
    info: AgentProcessInfo,
    session_token: Option<String>,
    transport_room: Option<String>,
    /// Bumped on every launch; stale exit monitors compare against it
    generation: u64,
    process: Option<ProcessHandle>,
}

struct Launched {
    generation: u64,
    handle: ProcessHandle,
}

struct OrchestratorState {
    config: AgentsConfig,
    agents: RwLock<HashMap<String, AgentEntry>>,
    events: broadcast::Sender<AgentEvent>,
    sampler: UsageSampler,
}

impl OrchestratorState {
    fn emit(&self, info: &AgentProcessInfo) {
        // No subscribers is fine
        let _ = self.events.send(AgentEvent {
            agent_id: info.id.clone(),
            status: info.status,
            restart_count: info.restart_count,
            at: now_millis(),
        });
    }
}

/// Runs every agent as a child process of the gateway
pub struct ProcessOrchestrator {
    state: Arc<OrchestratorState>,
}

impl ProcessOrchestrator {
    /// Create a new orchestrator
    pub fn new(config: AgentsConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(OrchestratorState {
                config,
                agents: RwLock::new(HashMap::new()),
                events,
                sampler: UsageSampler::new(),
            }),
        }
    }
}

fn not_found(id: &str) -> Error {
    Error::NotFound(format!("Agent '{}' not found", id))
}

fn verify_session(entry: &AgentEntry, token: &str) -> Result<()> {
    match &entry.session_token {
        Some(expected) if constant_time_eq(expected, token) => Ok(()),
        _ => Err(Error::Forbidden(format!(
            "Invalid session token for agent '{}'",
            entry.info.id
        ))),
    }
}

/// Spawn the worker for `id` and wire its stdio into an RPC transport
async fn launch(state: &Arc<OrchestratorState>, id: &str) -> Result<Launched> {
    let (program, args) = state.config.worker_command()?;
    let (name, room, scope) = {
        let agents = state.agents.read().await;
        let entry = agents.get(id).ok_or_else(|| not_found(id))?;
        (
            entry.info.name.clone(),
            entry.transport_room.clone().unwrap_or_default(),
            entry.info.scope.clone(),
        )
    };

    tracing::info!(
        agent_id = id,
        program = %program.display(),
        "Spawning agent process"
    );

    let mut child = Command::new(&program)
        .args(&args)
        .env(ENV_AGENT_ID, id)
        .env(ENV_AGENT_NAME, &name)
        .env(ENV_TRANSPORT_ROOM, &room)
        .env(ENV_AGENT_SCOPE, scope.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            Error::Upstream(format!(
                "Failed to spawn agent process at {}: {}",
                program.display(),
                e
            ))
        })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Upstream("Agent process stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Upstream("Agent process stdout unavailable".to_string()))?;

    let channel: Arc<dyn DuplexChannel> = Arc::new(StreamChannel::new(stdout, stdin));
    let handle = ProcessHandle {
        rpc: RpcTransport::new(channel),
        kill: CancellationToken::new(),
        exited: CancellationToken::new(),
    };

    let generation = {
        let mut agents = state.agents.write().await;
        // Dropping `child` here kills it
        let entry = agents.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.generation += 1;
        entry.process = Some(handle.clone());
        entry.info.pid = child.id();
        entry.info.status = AgentProcessStatus::Starting;
        entry.info.last_started_at = Some(now_millis());
        entry.info.exit_code = None;
        state.emit(&entry.info);
        entry.generation
    };

    spawn_exit_monitor(state.clone(), id.to_string(), generation, child, handle.clone());

    Ok(Launched { generation, handle })
}

/// Reap the child and react to its exit
fn spawn_exit_monitor(
    state: Arc<OrchestratorState>,
    id: String,
    generation: u64,
    mut child: Child,
    handle: ProcessHandle,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = handle.kill.cancelled() => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(agent_id = %id, "Kill failed: {}", e);
                }
                child.wait().await
            }
        };
        let exit_code = match status {
            Ok(status) => status.code(),
            Err(_) => Some(-1),
        };
        handle.exited.cancel();

        tracing::info!(agent_id = %id, exit_code = ?exit_code, "Agent process exited");
        handle_exit(&state, &id, generation, exit_code).await;
    });
}

async fn handle_exit(
    state: &Arc<OrchestratorState>,
    id: &str,
    generation: u64,
    exit_code: Option<i32>,
) {
    let relaunch = {
        let mut agents = state.agents.write().await;
        let Some(entry) = agents.get_mut(id) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        if let Some(pid) = entry.info.pid.take() {
            state.sampler.forget(pid);
        }
        entry.process = None;
        entry.info.exit_code = exit_code;
        entry.info.cpu = 0.0;
        entry.info.memory = 0;

        match entry.info.status {
            // stop() owns the transition to stopped
            AgentProcessStatus::Stopping | AgentProcessStatus::Stopped => false,
            // First launch failing: start() reports it and cleans up
            AgentProcessStatus::Starting if entry.info.restart_count == 0 => false,
            AgentProcessStatus::Starting | AgentProcessStatus::Running => {
                if entry.info.restart_count < state.config.max_restarts {
                    entry.info.restart_count += 1;
                    tracing::warn!(
                        agent_id = id,
                        restart_count = entry.info.restart_count,
                        "Agent process exited unexpectedly, relaunching"
                    );
                    true
                } else {
                    tracing::warn!(
                        agent_id = id,
                        restart_count = entry.info.restart_count,
                        "Agent process exited, restart limit reached"
                    );
                    entry.info.status = AgentProcessStatus::Stopped;
                    state.emit(&entry.info);
                    false
                }
            }
        }
    };

    if relaunch {
        match launch(state, id).await {
            Ok(launched) => spawn_readiness_probe(state.clone(), id.to_string(), launched),
            Err(e) => {
                tracing::warn!(agent_id = id, "Failed to relaunch agent process: {}", e);
                let mut agents = state.agents.write().await;
                if let Some(entry) = agents.get_mut(id) {
                    entry.info.status = AgentProcessStatus::Stopped;
                    state.emit(&entry.info);
                }
            }
        }
    }
}

/// Ping the child until it answers or the ready timeout expires.
/// Marks the agent running on success.
async fn await_ready(
    state: &OrchestratorState,
    id: &str,
    generation: u64,
    handle: &ProcessHandle,
) -> bool {
    let deadline = tokio::time::Instant::now() + state.config.ready_timeout();
    let ready = loop {
        let answered = tokio::select! {
            _ = handle.exited.cancelled() => break false,
            attempt = tokio::time::timeout(READY_PROBE_ATTEMPT, handle.rpc.call("ping", None, None)) => {
                matches!(attempt, Ok(ref response) if response.is_success())
            }
        };
        if answered {
            break true;
        }
        if tokio::time::Instant::now() >= deadline {
            break false;
        }
        tokio::time::sleep(READY_PROBE_BACKOFF).await;
    };

    if !ready {
        return false;
    }

    let mut agents = state.agents.write().await;
    match agents.get_mut(id) {
        Some(entry)
            if entry.generation == generation
                && entry.info.status == AgentProcessStatus::Starting =>
        {
            entry.info.status = AgentProcessStatus::Running;
            entry.info.last_seen_at = Some(now_millis());
            state.emit(&entry.info);
            tracing::info!(agent_id = id, pid = ?entry.info.pid, "Agent process ready");
            true
        }
        _ => false,
    }
}

fn spawn_readiness_probe(state: Arc<OrchestratorState>, id: String, launched: Launched) {
    tokio::spawn(async move {
        let Launched { generation, handle } = launched;
        if !await_ready(&state, &id, generation, &handle).await && !handle.exited.is_cancelled() {
            tracing::warn!(agent_id = %id, "Agent process failed readiness probe, killing");
            handle.kill.cancel();
        }
    });
}

/// Ask the child to shut down, then force-kill it after the grace period
async fn terminate(config: &AgentsConfig, id: &str, handle: &ProcessHandle) {
    let grace = config.stop_timeout();

    let _ = tokio::time::timeout(grace, async {
        tokio::select! {
            _ = handle.rpc.call("shutdown", None, None) => {}
            _ = handle.exited.cancelled() => {}
        }
    })
    .await;

    if tokio::time::timeout(grace, handle.exited.cancelled())
        .await
        .is_err()
    {
        tracing::warn!(agent_id = id, "Agent process ignored shutdown, killing");
        handle.kill.cancel();
        handle.exited.cancelled().await;
    }
}

/// Final transition to stopped; revokes the session
async fn finalize_stopped(state: &OrchestratorState, id: &str) {
    let mut agents = state.agents.write().await;
    if let Some(entry) = agents.get_mut(id) {
        if let Some(pid) = entry.info.pid.take() {
            state.sampler.forget(pid);
        }
        entry.process = None;
        entry.session_token = None;
        entry.transport_room = None;
        entry.info.status = AgentProcessStatus::Stopped;
        entry.info.cpu = 0.0;
        entry.info.memory = 0;
        state.emit(&entry.info);
    }
}

/// Move a verified agent to stopping and hand back its process, if any
async fn begin_stop(
    state: &OrchestratorState,
    id: &str,
    token: Option<&str>,
) -> Result<Option<ProcessHandle>> {
    let mut agents = state.agents.write().await;
    let entry = agents.get_mut(id).ok_or_else(|| not_found(id))?;
    if let Some(token) = token {
        verify_session(entry, token)?;
    }
    if entry.info.status == AgentProcessStatus::Stopping {
        return Err(Error::Conflict(format!("Agent '{}' is already stopping", id)));
    }
    entry.info.status = AgentProcessStatus::Stopping;
    state.emit(&entry.info);
    Ok(entry.process.clone())
}

#[async_trait]
impl AgentOrchestrator for ProcessOrchestrator {
    async fn create(&self, input: CreateAgentInput) -> Result<CreateAgentOutput> {
        let id = input
            .id
            .unwrap_or_else(|| format!("agent_{}", Uuid::new_v4().simple()));
        if id.trim().is_empty() {
            return Err(Error::Validation("Agent id must not be empty".to_string()));
        }
        if input.name.trim().is_empty() {
            return Err(Error::Validation("Agent name must not be empty".to_string()));
        }

        let mut agents = self.state.agents.write().await;
        if agents.contains_key(&id) {
            return Err(Error::Conflict(format!("Agent '{}' already exists", id)));
        }

        let info = AgentProcessInfo::new(id.clone(), input.name.clone());
        self.state.emit(&info);
        agents.insert(
            id.clone(),
            AgentEntry {
                info,
                session_token: None,
                transport_room: None,
                generation: 0,
                process: None,
            },
        );
        tracing::info!(agent_id = %id, name = %input.name, "Agent created");

        Ok(CreateAgentOutput {
            id: id.clone(),
            client_config: ClientConfig {
                agent_id: id,
                name: input.name,
                transport: "stdio".to_string(),
            },
        })
    }

    async fn start(&self, input: StartAgentInput) -> Result<StartAgentOutput> {
        let (session_token, transport_room) = {
            let mut agents = self.state.agents.write().await;
            let entry = agents.get_mut(&input.id).ok_or_else(|| not_found(&input.id))?;
            if entry.info.status != AgentProcessStatus::Stopped {
                return Err(Error::Conflict(format!(
                    "Agent '{}' is already {}",
                    input.id,
                    entry.info.status.as_str()
                )));
            }
            let session_token = generate_token();
            let transport_room = format!("room_{}", Uuid::new_v4().simple());
            entry.session_token = Some(session_token.clone());
            entry.transport_room = Some(transport_room.clone());
            entry.info.scope = input.scope;
            entry.info.restart_count = 0;
            // Claimed before the lock is released so concurrent starts conflict
            entry.info.status = AgentProcessStatus::Starting;
            (session_token, transport_room)
        };

        let launched = match launch(&self.state, &input.id).await {
            Ok(launched) => launched,
            Err(e) => {
                tracing::warn!(agent_id = %input.id, "Failed to start agent: {}", e);
                finalize_stopped(&self.state, &input.id).await;
                return Err(e);
            }
        };

        if !await_ready(&self.state, &input.id, launched.generation, &launched.handle).await {
            tracing::warn!(agent_id = %input.id, "Agent did not become ready, stopping");
            if let Ok(Some(handle)) = begin_stop(&self.state, &input.id, None).await {
                handle.kill.cancel();
                handle.exited.cancelled().await;
            }
            finalize_stopped(&self.state, &input.id).await;
            return Err(Error::Upstream(format!(
                "Agent '{}' did not become ready within {}ms",
                input.id, self.state.config.ready_timeout_ms
            )));
        }

        Ok(StartAgentOutput {
            session_token,
            transport_room,
        })
    }

    async fn stop(&self, input: SessionInput) -> Result<()> {
        let handle = begin_stop(&self.state, &input.id, Some(&input.session_token)).await?;
        if let Some(handle) = handle {
            tracing::info!(agent_id = %input.id, "Stopping agent process");
            terminate(&self.state.config, &input.id, &handle).await;
        }
        finalize_stopped(&self.state, &input.id).await;
        Ok(())
    }

    async fn ping(&self, input: SessionInput) -> Result<String> {
        let rpc = {
            let agents = self.state.agents.read().await;
            let entry = agents.get(&input.id).ok_or_else(|| not_found(&input.id))?;
            verify_session(entry, &input.session_token)?;
            match (&entry.process, entry.info.status) {
                (Some(process), AgentProcessStatus::Running) => process.rpc.clone(),
                (_, status) => {
                    return Err(Error::Conflict(format!(
                        "Agent '{}' is {}",
                        input.id,
                        status.as_str()
                    )))
                }
            }
        };

        let pong: String = rpc
            .call_typed("ping", Value::Null)
            .await
            .map_err(|e| Error::Upstream(format!("Agent ping failed: {}", e)))?;

        if let Some(entry) = self.state.agents.write().await.get_mut(&input.id) {
            entry.info.last_seen_at = Some(now_millis());
        }
        Ok(pong)
    }

    async fn info(&self, input: SessionInput) -> Result<AgentProcessInfo> {
        let mut info = {
            let agents = self.state.agents.read().await;
            let entry = agents.get(&input.id).ok_or_else(|| not_found(&input.id))?;
            verify_session(entry, &input.session_token)?;
            entry.info.clone()
        };
        let Some(pid) = info.pid else {
            return Ok(info);
        };

        // procfs reads happen off the runtime and outside the agents lock
        let state = self.state.clone();
        let usage = tokio::task::spawn_blocking(move || state.sampler.sample(pid))
            .await
            .unwrap_or_default();
        info.cpu = usage.cpu;
        info.memory = usage.memory;

        if let Some(entry) = self.state.agents.write().await.get_mut(&input.id) {
            if entry.info.pid == Some(pid) {
                entry.info.cpu = usage.cpu;
                entry.info.memory = usage.memory;
            }
        }
        Ok(info)
    }

    async fn heartbeat(&self, input: SessionInput) -> Result<()> {
        let mut agents = self.state.agents.write().await;
        let entry = agents.get_mut(&input.id).ok_or_else(|| not_found(&input.id))?;
        verify_session(entry, &input.session_token)?;
        entry.info.last_seen_at = Some(now_millis());
        Ok(())
    }

    async fn list(&self) -> Vec<AgentProcessInfo> {
        let mut infos: Vec<AgentProcessInfo> = self
            .state
            .agents
            .read()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.state.events.subscribe()
    }

    async fn shutdown(&self) {
        let running: Vec<(String, ProcessHandle)> = {
            let mut agents = self.state.agents.write().await;
            agents
                .values_mut()
                .filter_map(|entry| {
                    let handle = entry.process.clone()?;
                    entry.info.status = AgentProcessStatus::Stopping;
                    Some((entry.info.id.clone(), handle))
                })
                .collect()
        };
        if running.is_empty() {
            return;
        }

        tracing::info!("Stopping {} agent processes", running.len());
        let state = &self.state;
        futures::future::join_all(running.iter().map(|(id, handle)| async move {
            terminate(&state.config, id, handle).await;
            finalize_stopped(state, id).await;
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orchestrator_with(config: AgentsConfig) -> ProcessOrchestrator {
        ProcessOrchestrator::new(config)
    }

    fn orchestrator() -> ProcessOrchestrator {
        orchestrator_with(AgentsConfig::default())
    }

    fn create_input(id: Option<&str>, name: &str) -> CreateAgentInput {
        CreateAgentInput {
            id: id.map(str::to_string),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let orchestrator = orchestrator();
        let output = orchestrator
            .create(create_input(Some("a1"), "alpha"))
            .await
            .unwrap();
        assert_eq!(output.id, "a1");
        assert_eq!(output.client_config.name, "alpha");

        let generated = orchestrator.create(create_input(None, "beta")).await.unwrap();
        assert!(generated.id.starts_with("agent_"));

        let list = orchestrator.list().await;
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|info| info.status == AgentProcessStatus::Stopped));
    }

    #[tokio::test]
    async fn test_create_duplicate_conflicts() {
        let orchestrator = orchestrator();
        orchestrator.create(create_input(Some("a1"), "alpha")).await.unwrap();
        let result = orchestrator.create(create_input(Some("a1"), "again")).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_create_rejects_blank_name() {
        let result = orchestrator().create(create_input(Some("a1"), "  ")).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_create_emits_event() {
        let orchestrator = orchestrator();
        let mut events = orchestrator.subscribe();
        orchestrator.create(create_input(Some("a1"), "alpha")).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.agent_id, "a1");
        assert_eq!(event.status, AgentProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_unknown_agent() {
        let result = orchestrator()
            .start(StartAgentInput {
                id: "missing".to_string(),
                scope: Value::Null,
            })
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_session_operations_require_token() {
        let orchestrator = orchestrator();
        orchestrator.create(create_input(Some("a1"), "alpha")).await.unwrap();

        let session = SessionInput {
            id: "a1".to_string(),
            session_token: "guess".to_string(),
        };
        assert!(matches!(orchestrator.ping(session.clone()).await, Err(Error::Forbidden(_))));
        assert!(matches!(orchestrator.info(session.clone()).await, Err(Error::Forbidden(_))));
        assert!(matches!(orchestrator.stop(session.clone()).await, Err(Error::Forbidden(_))));
        assert!(matches!(orchestrator.heartbeat(session).await, Err(Error::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_start_with_missing_binary_stays_stopped() {
        let orchestrator = orchestrator_with(AgentsConfig {
            command: Some("/nonexistent/agentgate-worker".into()),
            ..Default::default()
        });
        orchestrator.create(create_input(Some("a1"), "alpha")).await.unwrap();

        let result = orchestrator
            .start(StartAgentInput {
                id: "a1".to_string(),
                scope: json!({"team": "x"}),
            })
            .await;
        assert!(matches!(result, Err(Error::Upstream(_))));

        let list = orchestrator.list().await;
        assert_eq!(list[0].status, AgentProcessStatus::Stopped);
        assert!(list[0].pid.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_with_silent_child_times_out() {
        let orchestrator = orchestrator_with(AgentsConfig {
            command: Some("/bin/sh".into()),
            args: vec!["-c".to_string(), "cat > /dev/null".to_string()],
            ready_timeout_ms: 300,
            ..Default::default()
        });
        orchestrator.create(create_input(Some("a1"), "alpha")).await.unwrap();

        let result = orchestrator
            .start(StartAgentInput {
                id: "a1".to_string(),
                scope: Value::Null,
            })
            .await;
        assert!(matches!(result, Err(Error::Upstream(_))));

        let list = orchestrator.list().await;
        assert_eq!(list[0].status, AgentProcessStatus::Stopped);
        assert_eq!(list[0].restart_count, 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_info_samples_usage() {
        let orchestrator = orchestrator();
        orchestrator.create(create_input(Some("a1"), "alpha")).await.unwrap();
        {
            let mut agents = orchestrator.state.agents.write().await;
            let entry = agents.get_mut("a1").unwrap();
            entry.session_token = Some("token".to_string());
            entry.info.pid = Some(std::process::id());
        }
        let session = SessionInput {
            id: "a1".to_string(),
            session_token: "token".to_string(),
        };

        let info = orchestrator.info(session).await.unwrap();
        assert!(info.memory > 0);
        assert_eq!(orchestrator.list().await[0].memory, info.memory);
    }

    #[test]
    fn test_status_names() {
        assert_eq!(AgentProcessStatus::Running.as_str(), "running");
        assert_eq!(
            serde_json::to_value(AgentProcessStatus::Stopping).unwrap(),
            json!("stopping")
        );
    }
}
