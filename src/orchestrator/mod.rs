//! Agent process orchestration
//!
//! The gateway only sees the [`AgentOrchestrator`] trait. The concrete
//! [`ProcessOrchestrator`] runs every agent as a child process speaking RPC
//! over its stdin/stdout.
//!
//! ```text
//! gateway ──► AgentOrchestrator ──► ProcessOrchestrator
//!                                      │ spawn(worker)
//!                                      ▼
//!                           child stdin/stdout ◄─► StreamChannel ◄─► RpcTransport
//! ```

pub mod launcher;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

pub use launcher::ProcessOrchestrator;
pub use telemetry::{ProcessUsage, UsageSampler};
pub use types::{
    AgentEvent, AgentProcessInfo, AgentProcessStatus, ClientConfig, CreateAgentInput,
    CreateAgentOutput, SessionInput, StartAgentInput, StartAgentOutput,
};

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Lifecycle operations on managed agents
#[async_trait]
pub trait AgentOrchestrator: Send + Sync {
    /// Register a new agent in `stopped`
    async fn create(&self, input: CreateAgentInput) -> Result<CreateAgentOutput>;

    /// Launch the agent and mint its session token
    async fn start(&self, input: StartAgentInput) -> Result<StartAgentOutput>;

    /// Stop the agent and revoke its session token
    async fn stop(&self, input: SessionInput) -> Result<()>;

    /// Round-trip a ping through the agent process
    async fn ping(&self, input: SessionInput) -> Result<String>;

    /// Current record with fresh telemetry
    async fn info(&self, input: SessionInput) -> Result<AgentProcessInfo>;

    /// Record client liveness
    async fn heartbeat(&self, input: SessionInput) -> Result<()>;

    /// Every managed agent, oldest first
    async fn list(&self) -> Vec<AgentProcessInfo>;

    /// Lifecycle event feed
    fn subscribe(&self) -> broadcast::Receiver<AgentEvent>;

    /// Stop every running agent
    async fn shutdown(&self);
}
