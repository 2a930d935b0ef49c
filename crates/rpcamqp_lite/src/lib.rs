//! RPC semantics over an AMQP message broker with automatic
//! request/response correlation.
//!
//! Microservices invoke GraphQL operations on each other by queue name
//! instead of network address. A client publishes `{query, variables}`
//! to the target's work queue with `correlation_id` and `reply_to`
//! message properties; the target's server runs its local executor and
//! publishes `{data, errors}` back to the caller's process-private
//! reply queue with the same correlation id; the caller's reply
//! listener resolves the matching pending call. Many calls may be in
//! flight concurrently over the process's single broker connection.
//!
//! # Example
//!
//! ```ignore
//! use rpcamqp_lite::{Connection, RpcClient, RpcConfig, RpcServer, ReplyEnvelope};
//! use serde_json::json;
//!
//! let conn = Connection::connect(RpcConfig::new("amqp://localhost:5672")).await?;
//!
//! // Serve this process's own queue.
//! RpcServer::new(&conn)
//!     .receive("api-project", |req| async move {
//!         Ok(ReplyEnvelope::ok(execute(&req.query, &req.variables).await?))
//!     })
//!     .await?;
//!
//! // Call another service.
//! let data = RpcClient::new(&conn)
//!     .call(
//!         "api-event",
//!         "query($evid:ID!){event(evid:$evid){name}}",
//!         json!({ "evid": "E1" }),
//!     )
//!     .await?;
//! ```

mod client;
mod config;
mod connection;
mod correlation;
mod envelope;
mod error;
mod listener;
mod pending;
mod server;
pub mod transport;

pub use client::RpcClient;
pub use config::RpcConfig;
pub use connection::{Connection, ConnectionState};
pub use correlation::CorrelationId;
pub use envelope::{GraphQLError, ReplyEnvelope, RequestEnvelope};
pub use error::{RpcError, ServerError, TransportError};
pub use pending::{PendingCalls, PendingGuard, PendingReceiver};
pub use server::RpcServer;
