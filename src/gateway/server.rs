//! Gateway request pipeline

use super::definition::{CompiledHandler, HandlerId, HandlerKind, HandlerTable};
use super::envelope::{Envelope, Payload, StreamAction};
use super::error::{ApiError, ErrorCode, OperationResult};
use super::handlers::{CallContext, Handlers};
use super::stream::{SubscriptionEvent, SubscriptionSender, UpdateSink};
use crate::canon;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::orchestrator::AgentOrchestrator;
use crate::rpc::Schema;
use crate::token::{constant_time_eq, generate_token};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Receives encoded update frames for a WebSocket connection
pub type StreamSink = Arc<dyn Fn(String) + Send + Sync>;

/// Transport a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    WebSocket,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::WebSocket => "ws",
        }
    }
}

/// Transport-level facts about a request
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub transport: Transport,
    /// Set for WebSocket connections; scopes their subscriptions
    pub connection_id: Option<String>,
    /// `Authorization: Bearer` token of the HTTP request or upgrade
    pub bearer: Option<String>,
}

impl RequestMeta {
    pub fn http(bearer: Option<String>) -> Self {
        Self {
            transport: Transport::Http,
            connection_id: None,
            bearer,
        }
    }

    pub fn websocket(connection_id: impl Into<String>, bearer: Option<String>) -> Self {
        Self {
            transport: Transport::WebSocket,
            connection_id: Some(connection_id.into()),
            bearer,
        }
    }
}

/// Sanitized `[error, data]` tuple, ready for the wire
#[derive(Debug, Clone)]
pub struct PreparedResponse {
    pub result: Value,
    /// Canonical encoding of `result`
    pub text: String,
    pub status: u16,
    pub error: Option<ErrorCode>,
}

/// Outcome of [`Gateway::handle_request`]
#[derive(Debug, Clone)]
pub struct HandledRequest {
    /// `handlerId` of the envelope, when it could be read
    pub handler_id: Option<String>,
    pub request_id: Option<String>,
    pub response: String,
    pub result: Value,
    pub status: u16,
    pub error: Option<ErrorCode>,
}

/// Sanitize `result` into the wire tuple.
///
/// Successful data is checked against `output`; a mismatch becomes a
/// non-public `Internal` error.
pub fn prepare_response(
    result: OperationResult<Value>,
    output: Option<&Schema>,
    dev_mode: bool,
) -> PreparedResponse {
    let result = match (result, output) {
        (Ok(data), Some(schema)) => match schema.validate(&data) {
            Ok(()) => Ok(data),
            Err(failure) => Err(ApiError::internal("Handler output failed validation")
                .with_details(failure.to_value())
                .with_cause(failure.summary())),
        },
        (result, _) => result,
    };

    match result {
        Ok(data) => {
            let result = json!([Value::Null, data]);
            PreparedResponse {
                text: canon::stringify(&result),
                result,
                status: 200,
                error: None,
            }
        }
        Err(err) => {
            let result = json!([encode_error(&err, dev_mode), Value::Null]);
            PreparedResponse {
                text: canon::stringify(&result),
                result,
                status: err.status(dev_mode),
                error: Some(err.code),
            }
        }
    }
}

fn encode_error(err: &ApiError, dev_mode: bool) -> Value {
    match serde_json::to_value(err.to_public(dev_mode)) {
        Ok(value) => value,
        Err(e) => {
            let fallback = ApiError::internal(format!("Failed to encode error: {}", e));
            tracing::error!(error_id = %fallback.id, original = %err.id, "{}", fallback.message);
            json!({
                "id": fallback.id,
                "code": "Internal",
                "message": "Internal error",
                "httpEquivalent": 500,
            })
        }
    }
}

fn subscription_key(connection_id: &str, subscription_id: &str) -> String {
    format!("{}/{}", connection_id, subscription_id)
}

/// API gateway
pub struct Gateway {
    config: ServerConfig,
    token: String,
    table: HandlerTable,
    handlers: Arc<Handlers>,
    streams: HashMap<HandlerId, SubscriptionSender>,
    /// connection id → (stream, internal subscription key)
    connections: Mutex<HashMap<String, HashSet<(HandlerId, String)>>>,
}

impl Gateway {
    fn new(
        config: ServerConfig,
        token: String,
        orchestrator: Arc<dyn AgentOrchestrator>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Gateway("Gateway must be built inside a Tokio runtime".to_string())
        })?;
        let table = HandlerTable::compile()?;
        let handlers = Arc::new(Handlers::new(orchestrator));

        let mut streams = HashMap::new();
        for handler in table.of_kind(HandlerKind::Stream) {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Some(routine) = handlers.stream_routine(handler.id, rx) {
                runtime.spawn(routine);
                streams.insert(handler.id, tx);
            }
        }

        tracing::info!(
            handlers = HandlerId::ALL.len(),
            streams = streams.len(),
            dev_mode = config.dev_mode,
            "Gateway initialized"
        );

        Ok(Self {
            config,
            token,
            table,
            handlers,
            streams,
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn table(&self) -> &HandlerTable {
        &self.table
    }

    pub fn orchestrator(&self) -> &Arc<dyn AgentOrchestrator> {
        self.handlers.orchestrator()
    }

    pub fn body_limit(&self) -> usize {
        self.config.body_limit_bytes
    }

    pub fn dev_mode(&self) -> bool {
        self.config.dev_mode
    }

    /// Constant-time comparison against the server token
    pub fn verify_server_token(&self, provided: &str) -> bool {
        constant_time_eq(&self.token, provided)
    }

    /// Run one request through the full pipeline. Never panics; every
    /// failure becomes an error tuple.
    pub async fn handle_request(
        &self,
        payload: Payload,
        meta: RequestMeta,
        sink: Option<StreamSink>,
    ) -> HandledRequest {
        let started = Instant::now();
        let envelope = match Envelope::parse(&payload) {
            Ok(envelope) => envelope,
            Err(err) => return self.finish(&meta, None, None, Err(err), None, started),
        };

        let handler_id = Some(envelope.handler_id.clone());
        let request_id = envelope.request_id.clone();
        let handler = match self.table.resolve(&envelope.handler_id) {
            Ok(handler) => handler,
            Err(err) => return self.finish(&meta, handler_id, request_id, Err(err), None, started),
        };

        let (result, output) = match self.dispatch(handler, &envelope, &meta, sink).await {
            Ok((data, output)) => (Ok(data), output),
            Err(err) => (Err(err), None),
        };
        self.finish(&meta, handler_id, request_id, result, output, started)
    }

    /// Build the reply for a request rejected before the pipeline
    pub fn reject(&self, meta: &RequestMeta, err: ApiError) -> HandledRequest {
        self.finish(meta, None, None, Err(err), None, Instant::now())
    }

    /// Start accepting subscriptions from `connection_id`
    pub fn open_connection(&self, connection_id: &str) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(connection_id.to_string())
            .or_default();
    }

    /// Drop every subscription created by `connection_id` and refuse new ones
    pub fn close_connection(&self, connection_id: &str) -> usize {
        let subscriptions = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id)
            .unwrap_or_default();

        for (handler_id, key) in &subscriptions {
            if let Some(queue) = self.streams.get(handler_id) {
                let _ = queue.send(SubscriptionEvent::Remove {
                    subscription_id: key.clone(),
                });
            }
        }
        if !subscriptions.is_empty() {
            tracing::debug!(
                connection_id = %connection_id,
                removed = subscriptions.len(),
                "Removed connection subscriptions"
            );
        }
        subscriptions.len()
    }

    /// Whether `payload` is a stream subscribe or unsubscribe request.
    ///
    /// These must be handled in arrival order within a connection.
    pub fn is_stream_request(&self, payload: &Payload) -> bool {
        Envelope::parse(payload)
            .ok()
            .and_then(|envelope| self.table.resolve(&envelope.handler_id).ok())
            .is_some_and(|handler| handler.kind == HandlerKind::Stream)
    }

    /// Live subscriptions created by `connection_id`
    pub fn subscription_count(&self, connection_id: &str) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection_id)
            .map_or(0, HashSet::len)
    }

    async fn dispatch(
        &self,
        handler: &CompiledHandler,
        envelope: &Envelope,
        meta: &RequestMeta,
        sink: Option<StreamSink>,
    ) -> OperationResult<(Value, Option<Schema>)> {
        if handler.protected {
            self.authorize(envelope, meta)?;
        }

        match handler.kind {
            HandlerKind::Call => {
                let data = input_data(handler, envelope)?;
                let output = self.run_call(handler, data).await?;
                Ok((output, handler.output.clone()))
            }
            HandlerKind::Cast => {
                let data = input_data(handler, envelope)?;
                self.run_cast(handler, data);
                Ok((Value::Null, None))
            }
            HandlerKind::Stream => {
                let (subscription_id, action) = envelope.stream_fields()?;
                let data = match action {
                    StreamAction::Subscribe => input_data(handler, envelope)?,
                    StreamAction::Unsubscribe => Value::Null,
                };
                let sink = sink.ok_or_else(|| {
                    ApiError::validation(format!(
                        "Handler '{}' is a stream and requires a WebSocket connection",
                        handler.id
                    ))
                })?;
                self.run_stream(handler, meta, subscription_id, action, data, sink)
            }
        }
    }

    fn authorize(&self, envelope: &Envelope, meta: &RequestMeta) -> OperationResult<()> {
        let candidates: Vec<&str> = [envelope.server_token.as_deref(), meta.bearer.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if candidates.is_empty() {
            return Err(ApiError::forbidden("Server token required"));
        }
        if candidates.iter().any(|token| self.verify_server_token(token)) {
            Ok(())
        } else {
            Err(ApiError::forbidden("Invalid server token"))
        }
    }

    fn timeout_of(&self, handler: &CompiledHandler) -> Duration {
        handler.timeout.unwrap_or_else(|| self.config.request_timeout())
    }

    async fn run_call(&self, handler: &CompiledHandler, data: Value) -> OperationResult<Value> {
        let id = handler.id;
        let timeout = self.timeout_of(handler);
        let cancel = CancellationToken::new();
        let ctx = CallContext {
            cancel: cancel.clone(),
        };
        let handlers = self.handlers.clone();
        let task = tokio::spawn(async move { handlers.call(id, data, &ctx).await });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                Err(ApiError::unknown(format!("Handler '{}' failed", id)).with_cause(join_error))
            }
            Err(_) => {
                cancel.cancel();
                Err(ApiError::timeout(format!(
                    "Handler '{}' timed out after {} ms",
                    id,
                    timeout.as_millis()
                )))
            }
        }
    }

    fn run_cast(&self, handler: &CompiledHandler, data: Value) {
        let id = handler.id;
        let timeout = self.timeout_of(handler);
        let handlers = self.handlers.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, handlers.cast(id, data)).await {
                Ok(Ok(())) => tracing::debug!(handler_id = %id, "Cast completed"),
                Ok(Err(err)) => tracing::warn!(
                    handler_id = %id,
                    error_id = %err.id,
                    code = ?err.code,
                    "Cast failed: {}",
                    err.message
                ),
                Err(_) => tracing::warn!(handler_id = %id, "Cast timed out"),
            }
        });
    }

    fn run_stream(
        &self,
        handler: &CompiledHandler,
        meta: &RequestMeta,
        subscription_id: String,
        action: StreamAction,
        data: Value,
        sink: StreamSink,
    ) -> OperationResult<(Value, Option<Schema>)> {
        let queue = self
            .streams
            .get(&handler.id)
            .ok_or_else(|| ApiError::internal(format!("Stream '{}' is not running", handler.id)))?;
        let connection_id = meta.connection_id.as_deref().ok_or_else(|| {
            ApiError::validation(format!(
                "Handler '{}' is a stream and requires a WebSocket connection",
                handler.id
            ))
        })?;
        let key = subscription_key(connection_id, &subscription_id);

        // Held while enqueueing so a close either sees the subscription or rejects it
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        let stopped = || {
            ApiError::internal(format!("Stream '{}' stopped accepting subscriptions", handler.id))
        };
        match action {
            StreamAction::Subscribe => {
                let tracked = connections
                    .get_mut(connection_id)
                    .ok_or_else(|| ApiError::validation("Connection is closed"))?;
                queue
                    .send(SubscriptionEvent::Add {
                        subscription_id: key.clone(),
                        data,
                        send: self.update_sink(handler, subscription_id.clone(), sink),
                    })
                    .map_err(|_| stopped())?;
                tracked.insert((handler.id, key));
            }
            StreamAction::Unsubscribe => {
                queue
                    .send(SubscriptionEvent::Remove {
                        subscription_id: key.clone(),
                    })
                    .map_err(|_| stopped())?;
                if let Some(tracked) = connections.get_mut(connection_id) {
                    tracked.remove(&(handler.id, key));
                }
            }
        }
        drop(connections);

        Ok((
            json!({"subscriptionId": subscription_id, "action": action.as_str()}),
            None,
        ))
    }

    /// Wrap a connection sink so pushed updates are sanitized like replies
    fn update_sink(
        &self,
        handler: &CompiledHandler,
        subscription_id: String,
        sink: StreamSink,
    ) -> UpdateSink {
        let handler_id = handler.id;
        let output = handler.output.clone();
        let dev_mode = self.config.dev_mode;
        Arc::new(move |result: OperationResult<Value>| {
            let prepared = prepare_response(result, output.as_ref(), dev_mode);
            let frame = json!({
                "type": "update",
                "handlerId": handler_id.as_str(),
                "subscriptionId": subscription_id,
                "result": prepared.result,
            });
            sink(canon::stringify(&frame));
        })
    }

    fn finish(
        &self,
        meta: &RequestMeta,
        handler_id: Option<String>,
        request_id: Option<String>,
        result: OperationResult<Value>,
        output: Option<Schema>,
        started: Instant,
    ) -> HandledRequest {
        if let Err(err) = &result {
            if err.public {
                tracing::debug!(error_id = %err.id, code = ?err.code, "{}", err.message);
            } else {
                tracing::error!(
                    error_id = %err.id,
                    code = ?err.code,
                    cause = err.cause.as_deref().unwrap_or(""),
                    "{}",
                    err.message
                );
            }
        }

        let prepared = prepare_response(result, output.as_ref(), self.config.dev_mode);
        tracing::info!(
            transport = meta.transport.as_str(),
            handler_id = handler_id.as_deref().unwrap_or("-"),
            status = prepared.status,
            duration_ms = started.elapsed().as_millis() as u64,
            "Request handled"
        );

        HandledRequest {
            handler_id,
            request_id,
            response: prepared.text,
            result: prepared.result,
            status: prepared.status,
            error: prepared.error,
        }
    }
}

/// Request data with the handler default applied and the input schema checked
fn input_data(handler: &CompiledHandler, envelope: &Envelope) -> OperationResult<Value> {
    let Some(schema) = &handler.input else {
        return Ok(envelope.data.clone().unwrap_or(Value::Null));
    };
    let data = envelope.data.clone().unwrap_or_else(|| json!({}));
    schema.validate(&data).map_err(|failure| {
        ApiError::validation(format!("Invalid input: {}", failure.summary()))
            .with_details(failure.to_value())
    })?;
    Ok(data)
}

/// Builder for [`Gateway`]
pub struct GatewayBuilder {
    config: ServerConfig,
    orchestrator: Option<Arc<dyn AgentOrchestrator>>,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            orchestrator: None,
        }
    }

    /// Set the server configuration
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the server token
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    /// Default handler timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn dev_mode(mut self, enabled: bool) -> Self {
        self.config.dev_mode = enabled;
        self
    }

    pub fn orchestrator(mut self, orchestrator: Arc<dyn AgentOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Build the gateway and start its stream routines.
    ///
    /// Must run inside a Tokio runtime. Without a configured token a random
    /// one is generated; read it back with [`Gateway::token`].
    pub fn build(self) -> Result<Gateway> {
        let orchestrator = self
            .orchestrator
            .ok_or_else(|| Error::Gateway("Gateway requires an orchestrator".to_string()))?;
        let token = match self.config.token.clone() {
            Some(token) if !token.is_empty() => token,
            _ => {
                let token = generate_token();
                tracing::warn!("No server token configured, generated a random one");
                token
            }
        };
        Gateway::new(self.config, token, orchestrator)
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
