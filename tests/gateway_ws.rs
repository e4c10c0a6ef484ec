//! WebSocket transport tests against a live server

use agentgate::api::build_app;
use agentgate::config::AgentsConfig;
use agentgate::gateway::GatewayBuilder;
use agentgate::orchestrator::ProcessOrchestrator;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const TOKEN: &str = "ws-test-token";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect() -> Socket {
    let orchestrator = Arc::new(ProcessOrchestrator::new(AgentsConfig {
        command: Some(env!("CARGO_BIN_EXE_agentgate").into()),
        args: vec!["worker".to_string()],
        ..AgentsConfig::default()
    }));
    let gateway = GatewayBuilder::new()
        .token(TOKEN)
        .orchestrator(orchestrator)
        .build()
        .unwrap();
    let app = build_app(Arc::new(gateway));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (socket, _) = connect_async(format!("ws://{}/api/ws", addr)).await.unwrap();
    socket
}

async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(15), socket.next())
            .await
            .expect("no frame before timeout")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Send an envelope and wait for its response frame, skipping updates
async fn request(socket: &mut Socket, request_id: &str, mut envelope: Value) -> Value {
    envelope["requestId"] = json!(request_id);
    socket
        .send(Message::Text(envelope.to_string()))
        .await
        .unwrap();
    loop {
        let frame = next_frame(socket).await;
        if frame["type"] == "response" && frame["requestId"] == request_id {
            return frame["result"].clone();
        }
    }
}

#[tokio::test]
async fn test_every_frame_gets_one_reply() {
    let mut socket = connect().await;
    socket.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    socket.send(Message::Text("not json".to_string())).await.unwrap();
    socket
        .send(Message::Text(
            json!({"handlerId": "server.ping", "serverToken": TOKEN, "requestId": "r1"})
                .to_string(),
        ))
        .await
        .unwrap();

    let mut validation = 0;
    let mut pong = 0;
    for _ in 0..3 {
        let frame = next_frame(&mut socket).await;
        assert_eq!(frame["type"], json!("response"));
        if frame["result"][0]["code"] == "Validation" {
            validation += 1;
        } else {
            assert_eq!(frame["requestId"], json!("r1"));
            assert_eq!(frame["handlerId"], json!("server.ping"));
            assert_eq!(frame["result"], json!([null, "pong"]));
            pong += 1;
        }
    }
    assert_eq!((validation, pong), (2, 1));
}

#[tokio::test]
async fn test_processes_stream_subscription() {
    let mut socket = connect().await;
    let ack = request(
        &mut socket,
        "sub",
        json!({
            "handlerId": "server.processes-stream",
            "serverToken": TOKEN,
            "subscriptionId": "s1",
            "action": "subscribe",
            "data": {"intervalMs": 1000},
        }),
    )
    .await;
    assert_eq!(ack, json!([null, {"subscriptionId": "s1", "action": "subscribe"}]));

    let update = loop {
        let frame = next_frame(&mut socket).await;
        if frame["type"] == "update" {
            break frame;
        }
    };
    assert_eq!(update["handlerId"], json!("server.processes-stream"));
    assert_eq!(update["subscriptionId"], json!("s1"));
    assert_eq!(update["result"], json!([null, []]));

    let ack = request(
        &mut socket,
        "unsub",
        json!({
            "handlerId": "server.processes-stream",
            "serverToken": TOKEN,
            "subscriptionId": "s1",
            "action": "unsubscribe",
        }),
    )
    .await;
    assert_eq!(ack[1]["action"], json!("unsubscribe"));
}

#[tokio::test]
async fn test_agent_flow_over_websocket() {
    let mut socket = connect().await;

    let created = request(
        &mut socket,
        "create",
        json!({"handlerId": "agent.create", "data": {"id": "ws1", "name": "socket agent"}}),
    )
    .await;
    assert_eq!(created[1]["id"], json!("ws1"));

    let started = request(
        &mut socket,
        "start",
        json!({"handlerId": "agent.start", "data": {"id": "ws1"}}),
    )
    .await;
    assert!(started[0].is_null(), "{}", started);
    let token = started[1]["sessionToken"].as_str().unwrap().to_string();
    let session = json!({"id": "ws1", "sessionToken": token});

    let pong = request(
        &mut socket,
        "ping",
        json!({"handlerId": "agent.ping", "data": session}),
    )
    .await;
    assert_eq!(pong, json!([null, "pong"]));

    let denied = request(
        &mut socket,
        "denied",
        json!({"handlerId": "agent.ping", "data": {"id": "ws1", "sessionToken": "wrong"}}),
    )
    .await;
    assert_eq!(denied[0]["code"], json!("Forbidden"));

    let stopped = request(
        &mut socket,
        "stop",
        json!({"handlerId": "agent.stop", "data": session}),
    )
    .await;
    assert_eq!(stopped, json!([null, null]));
}

#[tokio::test]
async fn test_back_to_back_unsubscribe_wins() {
    let mut socket = connect().await;
    for (request_id, action) in [("sub", "subscribe"), ("unsub", "unsubscribe")] {
        let envelope = json!({
            "handlerId": "server.processes-stream",
            "serverToken": TOKEN,
            "subscriptionId": "s1",
            "action": action,
            "requestId": request_id,
            "data": {"intervalMs": 1000},
        });
        socket
            .send(Message::Text(envelope.to_string()))
            .await
            .unwrap();
    }

    let mut acks = Vec::new();
    while acks.len() < 2 {
        let frame = next_frame(&mut socket).await;
        if frame["type"] == "response" {
            acks.push(frame["requestId"].clone());
        }
    }
    assert_eq!(acks, vec![json!("sub"), json!("unsub")]);

    // At most one update already in flight when the unsubscribe landed
    let mut updates = 0;
    let _ = tokio::time::timeout(Duration::from_millis(3_500), async {
        loop {
            if next_frame(&mut socket).await["type"] == "update" {
                updates += 1;
            }
        }
    })
    .await;
    assert!(updates <= 1, "received {} updates after unsubscribe", updates);
}
