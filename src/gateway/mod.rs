//! API gateway
//!
//! One pipeline serves both transports: `POST /api/http` bodies and
//! `GET /api/ws` text frames are parsed into an [`Envelope`], resolved in
//! the generated [`HandlerTable`], authorized, validated and dispatched to
//! a call, cast or stream handler. Replies are canonical `[error, data]`
//! tuples.

pub mod definition;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod server;
pub mod stream;

pub use definition::{HandlerId, HandlerKind, HandlerTable, ServerInfo};
pub use envelope::{Envelope, Payload, StreamAction};
pub use error::{ApiError, ErrorCode, OperationResult, PublicError};
pub use handlers::{CallContext, Handlers};
pub use server::{
    prepare_response, Gateway, GatewayBuilder, HandledRequest, RequestMeta, StreamSink, Transport,
};
pub use stream::{SubscriptionEvent, SubscriptionRegistry, UpdateSink};
