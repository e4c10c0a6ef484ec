//! Request/response RPC over a duplex channel

use super::procedure::{Procedure, ProcedureErrorKind};
use super::protocol::{
    RpcError, RpcErrorCode, RpcMessage, RpcRequest, RpcResponse, RPC_TOPIC,
};
use super::schema::Schema;
use crate::channel::DuplexChannel;
use crate::error::{Error, Result};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

/// How long `call` waits for a response
pub const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// RPC endpoint bound to one channel.
///
/// Every instance owns its own procedure table and pending-response map, so
/// independent connections never share correlation state.
pub struct RpcTransport {
    channel: Arc<dyn DuplexChannel>,
    procedures: RwLock<HashMap<String, Procedure>>,
    pending: Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>,
}

/// Removes a pending entry when the waiting call finishes or is dropped
struct PendingGuard<'a> {
    transport: &'a RpcTransport,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.transport.lock_pending().remove(&self.id);
    }
}

impl RpcTransport {
    /// Bind a transport to `channel` and start serving inbound traffic
    pub fn new(channel: Arc<dyn DuplexChannel>) -> Arc<Self> {
        let transport = Arc::new(Self {
            channel,
            procedures: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        });
        transport.init();
        transport
    }

    fn init(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.channel.receive_object(
            RPC_TOPIC,
            Arc::new(move |raw| {
                if let Some(transport) = weak.upgrade() {
                    transport.handle_inbound(raw);
                }
            }),
        );
    }

    /// Register a procedure, replacing any existing one with the same name
    pub fn register(&self, procedure: Procedure) {
        let name = procedure.name().to_string();
        let previous = self
            .procedures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), procedure);
        if previous.is_some() {
            tracing::warn!(procedure = %name, "Replacing previously registered procedure");
        }
    }

    /// Register a procedure, refusing duplicates
    pub fn try_register(&self, procedure: Procedure) -> Result<()> {
        let mut procedures = self
            .procedures
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if procedures.contains_key(procedure.name()) {
            return Err(Error::Conflict(format!(
                "Procedure '{}' is already registered",
                procedure.name()
            )));
        }
        procedures.insert(procedure.name().to_string(), procedure);
        Ok(())
    }

    /// Names of all registered procedures
    pub fn procedure_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .procedures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Number of calls still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<RpcResponse>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Invoke `name` on the peer.
    ///
    /// Always resolves within [`RPC_CALL_TIMEOUT`]; protocol failures are
    /// reported as error responses, never as `Err`.
    pub async fn call(
        &self,
        name: &str,
        input: Option<Value>,
        output_schema: Option<&Schema>,
    ) -> RpcResponse {
        let request = RpcRequest::new(name, input);
        let id = request.id.clone();

        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id.clone(), tx);
        let _guard = PendingGuard {
            transport: self,
            id: id.clone(),
        };

        let message = match serde_json::to_value(RpcMessage::Request(request)) {
            Ok(message) => message,
            Err(e) => {
                return RpcResponse::failure(
                    id,
                    name,
                    RpcError::new(RpcErrorCode::Unknown, format!("Failed to encode request: {}", e)),
                )
            }
        };

        if let Err(e) = self.channel.send_object(RPC_TOPIC, message).await {
            tracing::warn!(procedure = %name, "RPC send failed: {}", e);
            return RpcResponse::failure(
                id,
                name,
                RpcError::new(RpcErrorCode::Unknown, format!("Failed to send request: {}", e)),
            );
        }

        let response = match tokio::time::timeout(RPC_CALL_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => RpcResponse::failure(
                id,
                name,
                RpcError::new(RpcErrorCode::Unknown, "Response channel dropped"),
            ),
            Err(_) => {
                tracing::debug!(procedure = %name, request_id = %id, "RPC call timed out");
                RpcResponse::failure(
                    id,
                    name,
                    RpcError::new(
                        RpcErrorCode::Timeout,
                        format!(
                            "No response to '{}' within {}ms",
                            name,
                            RPC_CALL_TIMEOUT.as_millis()
                        ),
                    ),
                )
            }
        };

        match output_schema {
            Some(schema) if response.is_success() => {
                let data = response.data.clone().unwrap_or(Value::Null);
                match schema.validate(&data) {
                    Ok(()) => response,
                    Err(failure) => RpcResponse::failure(
                        response.id,
                        response.name,
                        RpcError::new(
                            RpcErrorCode::InvalidOutput,
                            format!("Response does not match output schema: {}", failure),
                        )
                        .with_raw(failure.to_value()),
                    ),
                }
            }
            _ => response,
        }
    }

    /// Invoke `name` and deserialize its output into `O`
    pub async fn call_typed<O>(&self, name: &str, input: impl Serialize) -> std::result::Result<O, RpcError>
    where
        O: DeserializeOwned + JsonSchema,
    {
        let schema = Schema::of::<O>()
            .map_err(|e| RpcError::new(RpcErrorCode::Unknown, e.to_string()))?;
        let input = serde_json::to_value(input)
            .map_err(|e| RpcError::new(RpcErrorCode::InvalidInput, e.to_string()))?;
        let input = if input.is_null() { None } else { Some(input) };

        let data = self.call(name, input, Some(&schema)).await.into_result()?;
        serde_json::from_value(data)
            .map_err(|e| RpcError::new(RpcErrorCode::InvalidOutput, e.to_string()))
    }

    fn handle_inbound(self: Arc<Self>, raw: Value) {
        let message = match serde_json::from_value::<RpcMessage>(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping malformed RPC message: {}", e);
                return;
            }
        };

        match message {
            RpcMessage::Response(response) => {
                let waiter = self.lock_pending().remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::debug!(request_id = %response.id, "Ignoring response without pending call");
                    }
                }
            }
            RpcMessage::Request(request) => {
                tokio::spawn(async move {
                    let response = self.dispatch(request).await;
                    let name = response.name.clone();
                    let message = match serde_json::to_value(RpcMessage::Response(response)) {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::warn!(procedure = %name, "Failed to encode RPC response: {}", e);
                            return;
                        }
                    };
                    if let Err(e) = self.channel.send_object(RPC_TOPIC, message).await {
                        tracing::warn!(procedure = %name, "Failed to send RPC response: {}", e);
                    }
                });
            }
        }
    }

    /// Run the named procedure; produces exactly one response
    async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest { id, name, input } = request;

        let procedure = self
            .procedures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned();
        let Some(procedure) = procedure else {
            return RpcResponse::failure(
                id,
                &name,
                RpcError::new(RpcErrorCode::NotFound, format!("Procedure '{}' not found", name)),
            );
        };

        let input = input.unwrap_or(Value::Null);
        if let Some(schema) = &procedure.schema().input {
            if let Err(failure) = schema.validate(&input) {
                return RpcResponse::failure(
                    id,
                    name,
                    RpcError::new(RpcErrorCode::InvalidInput, failure.summary())
                        .with_raw(failure.to_value()),
                );
            }
        }

        // A separate task keeps a panicking body from taking the dispatcher down
        let output = match tokio::spawn(procedure.execute(input)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let code = match e.kind {
                    ProcedureErrorKind::InvalidInput => RpcErrorCode::InvalidInput,
                    ProcedureErrorKind::Execution => RpcErrorCode::Unknown,
                };
                let mut error = RpcError::new(code, e.message);
                error.raw = e.raw;
                return RpcResponse::failure(id, name, error);
            }
            Err(join) => {
                tracing::warn!(procedure = %name, "Procedure task failed: {}", join);
                return RpcResponse::failure(
                    id,
                    name,
                    RpcError::new(RpcErrorCode::Unknown, "Procedure failed unexpectedly")
                        .with_raw(Value::String(join.to_string())),
                );
            }
        };

        if let Some(schema) = &procedure.schema().output {
            if let Err(failure) = schema.validate(&output) {
                return RpcResponse::failure(
                    id,
                    name,
                    RpcError::new(RpcErrorCode::InvalidOutput, failure.summary())
                        .with_raw(failure.to_value()),
                );
            }
        }

        RpcResponse::success(id, name, output)
    }
}
