//! Handler implementations

use super::definition::{HandlerId, ServerInfo};
use super::error::{ApiError, OperationResult};
use super::stream::{run_broadcast, run_polling, SubscriptionQueue};
use crate::orchestrator::{AgentOrchestrator, AgentProcessStatus, UsageSampler};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-invocation context
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Cancelled by the gateway when the handler times out
    pub cancel: CancellationToken,
}

/// Executes handlers against an orchestrator
pub struct Handlers {
    orchestrator: Arc<dyn AgentOrchestrator>,
    started_at: Instant,
    sampler: UsageSampler,
}

impl Handlers {
    pub fn new(orchestrator: Arc<dyn AgentOrchestrator>) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
            sampler: UsageSampler::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<dyn AgentOrchestrator> {
        &self.orchestrator
    }

    /// Run a `call` handler with already validated input
    pub async fn call(
        &self,
        id: HandlerId,
        data: Value,
        ctx: &CallContext,
    ) -> OperationResult<Value> {
        let orchestrator = &self.orchestrator;
        match id {
            HandlerId::ServerPing => Ok(Value::String("pong".to_string())),
            HandlerId::ServerInfo => encode(guarded(ctx, self.server_info()).await?),
            HandlerId::ServerProcesses => {
                let agents = guarded(ctx, async { Ok(orchestrator.list().await) }).await?;
                encode(agents)
            }
            HandlerId::AgentCreate => encode(orchestrator.create(decode(data)?).await?),
            HandlerId::AgentStart => encode(orchestrator.start(decode(data)?).await?),
            HandlerId::AgentStop => {
                orchestrator.stop(decode(data)?).await?;
                Ok(Value::Null)
            }
            HandlerId::AgentPing => {
                let input = decode(data)?;
                let pong = guarded(ctx, async {
                    orchestrator.ping(input).await.map_err(ApiError::from)
                })
                .await?;
                Ok(Value::String(pong))
            }
            HandlerId::AgentInfo => {
                let input = decode(data)?;
                let info = guarded(ctx, async {
                    orchestrator.info(input).await.map_err(ApiError::from)
                })
                .await?;
                encode(info)
            }
            HandlerId::AgentHeartbeat
            | HandlerId::ServerInfoStream
            | HandlerId::ServerProcessesStream
            | HandlerId::ServerEventsStream
            | HandlerId::AgentInfoStream => Err(ApiError::validation(format!(
                "Handler '{}' is not a call handler",
                id
            ))),
        }
    }

    /// Run a `cast` handler
    pub async fn cast(&self, id: HandlerId, data: Value) -> OperationResult<()> {
        match id {
            HandlerId::AgentHeartbeat => {
                self.orchestrator.heartbeat(decode(data)?).await?;
                Ok(())
            }
            _ => Err(ApiError::validation(format!(
                "Handler '{}' is not a cast handler",
                id
            ))),
        }
    }

    /// Start routine of a stream handler, `None` for other kinds
    pub fn stream_routine(
        self: &Arc<Self>,
        id: HandlerId,
        queue: SubscriptionQueue,
    ) -> Option<BoxFuture<'static, ()>> {
        let source = match id {
            HandlerId::ServerInfoStream => HandlerId::ServerInfo,
            HandlerId::ServerProcessesStream => HandlerId::ServerProcesses,
            HandlerId::AgentInfoStream => HandlerId::AgentInfo,
            HandlerId::ServerEventsStream => {
                let orchestrator = self.orchestrator.clone();
                return Some(run_broadcast(queue, move || orchestrator.subscribe()).boxed());
            }
            _ => return None,
        };

        let handlers = self.clone();
        let routine = run_polling(queue, move |data| {
            let handlers = handlers.clone();
            async move {
                let ctx = CallContext::default();
                handlers.call(source, data, &ctx).await
            }
        });
        Some(routine.boxed())
    }

    async fn server_info(&self) -> OperationResult<ServerInfo> {
        let agents = self.orchestrator.list().await;
        let pid = std::process::id();
        let usage = self.sampler.sample(pid);
        Ok(ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            agents: agents.len(),
            running: agents
                .iter()
                .filter(|a| a.status == AgentProcessStatus::Running)
                .count(),
            cpu: usage.cpu,
            memory: usage.memory,
        })
    }
}

/// Abandon a read-only operation once the request is cancelled
async fn guarded<T>(
    ctx: &CallContext,
    operation: impl Future<Output = OperationResult<T>>,
) -> OperationResult<T> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(ApiError::timeout("Request cancelled")),
        result = operation => result,
    }
}

fn decode<T: DeserializeOwned>(data: Value) -> OperationResult<T> {
    serde_json::from_value(data).map_err(|e| ApiError::validation(format!("Invalid input: {}", e)))
}

fn encode<T: Serialize>(output: T) -> OperationResult<Value> {
    serde_json::to_value(output)
        .map_err(|e| ApiError::internal(format!("Failed to encode output: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::error::ErrorCode;
    use crate::orchestrator::fake::FakeOrchestrator;
    use serde_json::json;
    use std::time::Duration;

    fn handlers() -> Handlers {
        Handlers::new(Arc::new(FakeOrchestrator::new()))
    }

    #[tokio::test]
    async fn test_server_ping() {
        let result = handlers()
            .call(HandlerId::ServerPing, Value::Null, &CallContext::default())
            .await
            .unwrap();
        assert_eq!(result, json!("pong"));
    }

    #[tokio::test]
    async fn test_agent_lifecycle() {
        let handlers = handlers();
        let ctx = CallContext::default();

        let created = handlers
            .call(HandlerId::AgentCreate, json!({"id": "a1", "name": "alpha"}), &ctx)
            .await
            .unwrap();
        assert_eq!(created["clientConfig"]["agentId"], json!("a1"));

        let started = handlers
            .call(HandlerId::AgentStart, json!({"id": "a1"}), &ctx)
            .await
            .unwrap();
        let token = started["sessionToken"].as_str().unwrap().to_string();

        let session = json!({"id": "a1", "sessionToken": token});
        let pong = handlers.call(HandlerId::AgentPing, session.clone(), &ctx).await.unwrap();
        assert_eq!(pong, json!("pong"));

        handlers.cast(HandlerId::AgentHeartbeat, session.clone()).await.unwrap();
        let info = handlers.call(HandlerId::AgentInfo, session.clone(), &ctx).await.unwrap();
        assert_eq!(info["status"], json!("running"));
        assert!(info["lastSeenAt"].is_u64());

        let server = handlers.call(HandlerId::ServerInfo, Value::Null, &ctx).await.unwrap();
        assert_eq!(server["agents"], json!(1));
        assert_eq!(server["running"], json!(1));

        let stopped = handlers.call(HandlerId::AgentStop, session, &ctx).await.unwrap();
        assert!(stopped.is_null());
    }

    #[tokio::test]
    async fn test_wrong_session_token_is_forbidden() {
        let handlers = handlers();
        let ctx = CallContext::default();
        handlers
            .call(HandlerId::AgentCreate, json!({"id": "a1", "name": "alpha"}), &ctx)
            .await
            .unwrap();
        handlers.call(HandlerId::AgentStart, json!({"id": "a1"}), &ctx).await.unwrap();

        let err = handlers
            .call(HandlerId::AgentPing, json!({"id": "a1", "sessionToken": "nope"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_validation() {
        let handlers = handlers();
        let err = handlers
            .call(HandlerId::AgentHeartbeat, Value::Null, &CallContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
        let err = handlers.cast(HandlerId::ServerPing, Value::Null).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[tokio::test]
    async fn test_cancel_abandons_read() {
        let orchestrator = FakeOrchestrator::with_ping_delay(Duration::from_secs(60));
        let handlers = Handlers::new(Arc::new(orchestrator));
        let ctx = CallContext::default();
        handlers
            .call(HandlerId::AgentCreate, json!({"id": "a1", "name": "alpha"}), &ctx)
            .await
            .unwrap();
        handlers.call(HandlerId::AgentStart, json!({"id": "a1"}), &ctx).await.unwrap();

        ctx.cancel.cancel();
        let err = handlers
            .call(
                HandlerId::AgentPing,
                json!({"id": "a1", "sessionToken": "token-a1"}),
                &ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
    }

    #[test]
    fn test_only_streams_have_routines() {
        let handlers = Arc::new(handlers());
        for id in HandlerId::ALL {
            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            let is_stream = id.definition().kind == crate::gateway::definition::HandlerKind::Stream;
            assert_eq!(handlers.stream_routine(id, rx).is_some(), is_stream, "{}", id);
        }
    }
}
