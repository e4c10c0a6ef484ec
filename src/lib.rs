//! agentgate - API gateway and process orchestrator for agent workers
//!
//! agentgate exposes a typed handler table over HTTP and WebSocket and
//! manages a fleet of agent worker processes, each reached through
//! schema-validated RPC over its stdin/stdout.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          agentgate                            │
//! │   POST /api/http ─┐                                           │
//! │                   ├─► Gateway pipeline ─► call / cast / stream │
//! │   GET  /api/ws ───┘        │                     │            │
//! │                            │            Subscription registry │
//! │                            ▼                                  │
//! │                    AgentOrchestrator                          │
//! └────────────────────────────┬─────────────────────────────────┘
//!                              │ spawn + NDJSON RPC on stdio
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    agentgate worker    agentgate worker    agentgate worker
//! ```
//!
//! ## Modules
//!
//! - [`channel`]: Topic-multiplexed duplex channels (memory, stdio, WebSocket)
//! - [`rpc`]: Schema-validated request/response RPC over a channel
//! - [`gateway`]: Envelope pipeline, handler table and stream subscriptions
//! - [`api`]: axum routes binding the gateway to HTTP and WebSocket
//! - [`orchestrator`]: Agent process lifecycle and telemetry
//! - [`worker`]: The process side of an agent
//! - [`config`]: Configuration management

pub mod api;
pub mod canon;
pub mod channel;
pub mod config;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod rpc;
pub mod token;
pub mod worker;

pub use config::AgentGateConfig;
pub use error::{Error, Result};
