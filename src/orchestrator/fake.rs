//! In-memory orchestrator for gateway tests

use super::types::{
    now_millis, AgentEvent, AgentProcessInfo, AgentProcessStatus, ClientConfig, CreateAgentInput,
    CreateAgentOutput, SessionInput, StartAgentInput, StartAgentOutput,
};
use super::AgentOrchestrator;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

pub(crate) struct FakeOrchestrator {
    agents: Mutex<HashMap<String, (AgentProcessInfo, Option<String>)>>,
    events: broadcast::Sender<AgentEvent>,
    /// Artificial latency of `ping`
    pub(crate) ping_delay: Duration,
}

impl FakeOrchestrator {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            agents: Mutex::new(HashMap::new()),
            events,
            ping_delay: Duration::ZERO,
        }
    }

    pub(crate) fn with_ping_delay(delay: Duration) -> Self {
        Self {
            ping_delay: delay,
            ..Self::new()
        }
    }

    pub(crate) fn emit(&self, agent_id: &str, status: AgentProcessStatus) {
        let _ = self.events.send(AgentEvent {
            agent_id: agent_id.to_string(),
            status,
            restart_count: 0,
            at: now_millis(),
        });
    }

    async fn verified(&self, input: &SessionInput) -> Result<AgentProcessInfo> {
        let agents = self.agents.lock().await;
        let (info, token) = agents
            .get(&input.id)
            .ok_or_else(|| Error::NotFound(format!("Agent '{}' not found", input.id)))?;
        if token.as_deref() != Some(input.session_token.as_str()) {
            return Err(Error::Forbidden("Invalid session token".to_string()));
        }
        Ok(info.clone())
    }
}

#[async_trait]
impl AgentOrchestrator for FakeOrchestrator {
    async fn create(&self, input: CreateAgentInput) -> Result<CreateAgentOutput> {
        let id = input.id.unwrap_or_else(|| "agent_fake".to_string());
        let mut agents = self.agents.lock().await;
        if agents.contains_key(&id) {
            return Err(Error::Conflict(format!("Agent '{}' already exists", id)));
        }
        agents.insert(
            id.clone(),
            (AgentProcessInfo::new(id.clone(), input.name.clone()), None),
        );
        Ok(CreateAgentOutput {
            id: id.clone(),
            client_config: ClientConfig {
                agent_id: id,
                name: input.name,
                transport: "memory".to_string(),
            },
        })
    }

    async fn start(&self, input: StartAgentInput) -> Result<StartAgentOutput> {
        let mut agents = self.agents.lock().await;
        let (info, token) = agents
            .get_mut(&input.id)
            .ok_or_else(|| Error::NotFound(format!("Agent '{}' not found", input.id)))?;
        info.status = AgentProcessStatus::Running;
        info.scope = input.scope;
        *token = Some(format!("token-{}", input.id));
        Ok(StartAgentOutput {
            session_token: format!("token-{}", input.id),
            transport_room: format!("room-{}", input.id),
        })
    }

    async fn stop(&self, input: SessionInput) -> Result<()> {
        self.verified(&input).await?;
        if let Some((info, token)) = self.agents.lock().await.get_mut(&input.id) {
            info.status = AgentProcessStatus::Stopped;
            *token = None;
        }
        Ok(())
    }

    async fn ping(&self, input: SessionInput) -> Result<String> {
        self.verified(&input).await?;
        tokio::time::sleep(self.ping_delay).await;
        Ok("pong".to_string())
    }

    async fn info(&self, input: SessionInput) -> Result<AgentProcessInfo> {
        self.verified(&input).await
    }

    async fn heartbeat(&self, input: SessionInput) -> Result<()> {
        self.verified(&input).await?;
        if let Some((info, _)) = self.agents.lock().await.get_mut(&input.id) {
            info.last_seen_at = Some(now_millis());
        }
        Ok(())
    }

    async fn list(&self) -> Vec<AgentProcessInfo> {
        let mut infos: Vec<AgentProcessInfo> = self
            .agents
            .lock()
            .await
            .values()
            .map(|(info, _)| info.clone())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) {}
}
