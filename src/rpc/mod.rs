//! Schema-validated RPC over duplex channels
//!
//! Each [`RpcTransport`] is both a client and a server: it can `call`
//! procedures registered on the peer and serves its own registered
//! procedures. Requests and responses travel on the `rpc` topic and are
//! correlated by id.

pub mod procedure;
pub mod protocol;
pub mod schema;
pub mod transport;

pub use procedure::{Procedure, ProcedureError, ProcedureSchema};
pub use protocol::{RpcError, RpcErrorCode, RpcMessage, RpcRequest, RpcResponse, RpcStatus, RPC_TOPIC};
pub use schema::{Schema, SchemaViolation, ValidationFailure};
pub use transport::{RpcTransport, RPC_CALL_TIMEOUT};
