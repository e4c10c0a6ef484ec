//! HTTP application for agentgate
//!
//! ## Endpoint Map
//!
//! | Route                   | Auth          | Description                        |
//! |-------------------------|---------------|------------------------------------|
//! | `GET /health`           | none          | Load balancer health probe         |
//! | `POST /api/http`        | per handler   | One envelope per request body      |
//! | `GET /api/ws`           | per handler   | One envelope per text frame        |
//! | `GET /server/info`      | bearer token  | `server.info` as plain JSON        |
//! | `GET /server/processes` | bearer token  | `server.processes` as plain JSON   |

use crate::canon;
use crate::gateway::{
    ApiError, Gateway, HandledRequest, HandlerId, Payload, RequestMeta, StreamSink,
};
use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Request, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the complete HTTP application
pub fn build_app(gateway: Arc<Gateway>) -> Router {
    let cors = build_cors(&gateway.config().cors_origins);

    let server_views = Router::new()
        .route("/server/info", get(server_info))
        .route("/server/processes", get(server_processes))
        .route_layer(middleware::from_fn_with_state(
            gateway.clone(),
            require_server_token,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/http", post(http_request))
        .route("/api/ws", get(ws_upgrade))
        .merge(server_views)
        .with_state(gateway)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn http_request(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let meta = RequestMeta::http(bearer_token(&headers));
    let handled = match read_body(&gateway, &headers, body).await {
        Ok(payload) => gateway.handle_request(payload, meta, None).await,
        Err(err) => gateway.reject(&meta, err),
    };
    json_response(handled.status, handled.response)
}

async fn server_info(State(gateway): State<Arc<Gateway>>, headers: HeaderMap) -> Response {
    server_view(&gateway, &headers, HandlerId::ServerInfo).await
}

async fn server_processes(State(gateway): State<Arc<Gateway>>, headers: HeaderMap) -> Response {
    server_view(&gateway, &headers, HandlerId::ServerProcesses).await
}

/// Run a protected call handler and return its bare data
async fn server_view(gateway: &Gateway, headers: &HeaderMap, id: HandlerId) -> Response {
    let envelope = json!({ "handlerId": id.as_str() });
    let handled = gateway
        .handle_request(
            Payload::Text(envelope.to_string()),
            RequestMeta::http(bearer_token(headers)),
            None,
        )
        .await;
    match handled.error {
        None => json_response(200, canon::stringify(&handled.result[1])),
        Some(_) => json_response(handled.status, canon::stringify(&handled.result[0])),
    }
}

// =============================================================================
// WebSocket
// =============================================================================

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let bearer = bearer_token(&headers);
    ws.on_upgrade(move |socket| serve_socket(gateway, socket, bearer))
}

/// Serve one WebSocket connection.
///
/// Every request frame is handled on its own task and answered with exactly
/// one `response` frame; stream updates share the same outbound queue.
async fn serve_socket(gateway: Arc<Gateway>, socket: WebSocket, bearer: Option<String>) {
    let connection_id = format!("conn_{}", uuid::Uuid::new_v4().simple());
    gateway.open_connection(&connection_id);
    tracing::info!(connection_id = %connection_id, "WebSocket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let send_connection_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                tracing::debug!(connection_id = %send_connection_id, "WebSocket send failed");
                break;
            }
        }
    });

    let sink: StreamSink = {
        let tx = tx.clone();
        Arc::new(move |frame: String| {
            let _ = tx.send(frame);
        })
    };

    // Calls and casts run concurrently; subscribe/unsubscribe keep arrival order
    let mut in_flight = JoinSet::new();
    let (ordered_tx, mut ordered_rx) = mpsc::unbounded_channel::<Payload>();
    {
        let gateway = gateway.clone();
        let tx = tx.clone();
        let sink = sink.clone();
        let meta = RequestMeta::websocket(connection_id.clone(), bearer.clone());
        in_flight.spawn(async move {
            while let Some(payload) = ordered_rx.recv().await {
                let _ = tx.send(answer_frame(&gateway, payload, meta.clone(), sink.clone()).await);
            }
        });
    }

    loop {
        let message = tokio::select! {
            message = ws_receiver.next() => message,
            Some(_) = in_flight.join_next() => continue,
        };
        let payload = match message {
            Some(Ok(Message::Text(text))) => Payload::Text(text),
            Some(Ok(Message::Binary(bytes))) => Payload::Binary(bytes),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!(connection_id = %connection_id, "WebSocket receive failed: {}", e);
                break;
            }
        };

        if payload_len(&payload) <= gateway.body_limit() && gateway.is_stream_request(&payload) {
            let _ = ordered_tx.send(payload);
            continue;
        }

        let gateway = gateway.clone();
        let tx = tx.clone();
        let sink = sink.clone();
        let meta = RequestMeta::websocket(connection_id.clone(), bearer.clone());
        in_flight.spawn(async move {
            let _ = tx.send(answer_frame(&gateway, payload, meta, sink).await);
        });
    }

    // Let queued stream requests and in-flight calls land before cleanup
    drop(ordered_tx);
    while in_flight.join_next().await.is_some() {}

    let removed = gateway.close_connection(&connection_id);
    send_task.abort();
    tracing::info!(
        connection_id = %connection_id,
        subscriptions = removed,
        "WebSocket disconnected"
    );
}

/// Run one inbound frame through the gateway and encode its response frame
async fn answer_frame(
    gateway: &Gateway,
    payload: Payload,
    meta: RequestMeta,
    sink: StreamSink,
) -> String {
    let handled = if payload_len(&payload) > gateway.body_limit() {
        gateway.reject(&meta, body_too_large(gateway.body_limit()))
    } else {
        gateway.handle_request(payload, meta, Some(sink)).await
    };
    response_frame(&handled)
}

/// `{"type":"response",...}` frame answering one request frame
fn response_frame(handled: &HandledRequest) -> String {
    let mut frame = json!({
        "type": "response",
        "handlerId": handled.handler_id,
        "result": handled.result,
    });
    if let (Some(request_id), Value::Object(map)) = (&handled.request_id, &mut frame) {
        map.insert("requestId".to_string(), Value::String(request_id.clone()));
    }
    canon::stringify(&frame)
}

fn payload_len(payload: &Payload) -> usize {
    match payload {
        Payload::Text(text) => text.len(),
        Payload::Binary(bytes) => bytes.len(),
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Reject `/server/*` requests without a valid bearer token
async fn require_server_token(
    State(gateway): State<Arc<Gateway>>,
    request: Request,
    next: Next,
) -> Response {
    match bearer_token(request.headers()) {
        Some(token) if gateway.verify_server_token(&token) => next.run(request).await,
        _ => {
            let meta = RequestMeta::http(None);
            let handled = gateway.reject(&meta, ApiError::forbidden("Invalid server token"));
            json_response(handled.status, canon::stringify(&handled.result[0]))
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn body_too_large(limit: usize) -> ApiError {
    ApiError::validation(format!("Request body exceeds {} bytes", limit)).with_status(413)
}

/// Read the body up to the gateway limit
async fn read_body(gateway: &Gateway, headers: &HeaderMap, body: Body) -> Result<Payload, ApiError> {
    let limit = gateway.body_limit();
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|length| length > limit) {
        return Err(body_too_large(limit));
    }

    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| body_too_large(limit))?;
    Ok(match String::from_utf8(bytes.to_vec()) {
        Ok(text) => Payload::Text(text),
        Err(e) => Payload::Binary(e.into_bytes()),
    })
}

fn json_response(status: u16, body: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response()
}

// =============================================================================
// CORS
// =============================================================================

/// Mirror the request origin unless an explicit list is configured.
/// Credentials are allowed either way.
fn build_cors(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::mirror_request()
    } else {
        let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}
