//! End-to-end orchestrator tests against the real worker binary

use agentgate::config::AgentsConfig;
use agentgate::orchestrator::{
    AgentOrchestrator, AgentProcessStatus, CreateAgentInput, ProcessOrchestrator, SessionInput,
    StartAgentInput,
};
use agentgate::Error;
use serde_json::json;
use std::time::Duration;

fn orchestrator() -> ProcessOrchestrator {
    ProcessOrchestrator::new(AgentsConfig {
        command: Some(env!("CARGO_BIN_EXE_agentgate").into()),
        args: vec!["worker".to_string()],
        ..AgentsConfig::default()
    })
}

async fn create_and_start(
    orchestrator: &ProcessOrchestrator,
    id: &str,
) -> agentgate::orchestrator::StartAgentOutput {
    orchestrator
        .create(CreateAgentInput {
            id: Some(id.to_string()),
            name: format!("{}-name", id),
        })
        .await
        .unwrap();
    orchestrator
        .start(StartAgentInput {
            id: id.to_string(),
            scope: json!({"team": "core"}),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_worker_lifecycle() {
    let orchestrator = orchestrator();
    let mut events = orchestrator.subscribe();
    let started = create_and_start(&orchestrator, "a1").await;
    assert!(started.transport_room.starts_with("room_"));

    let session = SessionInput {
        id: "a1".to_string(),
        session_token: started.session_token.clone(),
    };
    assert_eq!(orchestrator.ping(session.clone()).await.unwrap(), "pong");

    let info = orchestrator.info(session.clone()).await.unwrap();
    assert_eq!(info.status, AgentProcessStatus::Running);
    assert!(info.pid.is_some());
    assert_eq!(info.scope, json!({"team": "core"}));

    orchestrator.heartbeat(session.clone()).await.unwrap();
    assert!(orchestrator.info(session.clone()).await.unwrap().last_seen_at.is_some());

    let wrong = SessionInput {
        id: "a1".to_string(),
        session_token: "not-the-token".to_string(),
    };
    assert!(matches!(orchestrator.ping(wrong.clone()).await, Err(Error::Forbidden(_))));
    assert!(matches!(orchestrator.stop(wrong).await, Err(Error::Forbidden(_))));

    tokio::time::timeout(Duration::from_secs(15), orchestrator.stop(session.clone()))
        .await
        .unwrap()
        .unwrap();

    let listed = orchestrator.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, AgentProcessStatus::Stopped);
    assert!(listed[0].pid.is_none());

    // The revoked token no longer authorizes anything
    assert!(orchestrator.ping(session).await.is_err());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.status);
    }
    assert!(seen.contains(&AgentProcessStatus::Running));
    assert_eq!(seen.last(), Some(&AgentProcessStatus::Stopped));
}

#[tokio::test]
async fn test_restart_after_stop() {
    let orchestrator = orchestrator();
    let first = create_and_start(&orchestrator, "a2").await;
    orchestrator
        .stop(SessionInput {
            id: "a2".to_string(),
            session_token: first.session_token.clone(),
        })
        .await
        .unwrap();

    let second = orchestrator
        .start(StartAgentInput {
            id: "a2".to_string(),
            scope: serde_json::Value::Null,
        })
        .await
        .unwrap();
    assert_ne!(first.session_token, second.session_token);

    let session = SessionInput {
        id: "a2".to_string(),
        session_token: second.session_token,
    };
    assert_eq!(orchestrator.ping(session).await.unwrap(), "pong");
    orchestrator.shutdown().await;
    assert_eq!(orchestrator.list().await[0].status, AgentProcessStatus::Stopped);
}

#[tokio::test]
async fn test_start_twice_conflicts() {
    let orchestrator = orchestrator();
    create_and_start(&orchestrator, "a3").await;
    let again = orchestrator
        .start(StartAgentInput {
            id: "a3".to_string(),
            scope: serde_json::Value::Null,
        })
        .await;
    assert!(matches!(again, Err(Error::Conflict(_))));
    orchestrator.shutdown().await;
}
