use thiserror::Error;

use crate::envelope::GraphQLError;

/// Errors surfaced to callers of [`crate::RpcClient::call`].
///
/// Transport-level failures (`Connection`, `Timeout`, `Overloaded`) may
/// be retried by the caller; `Remote` is a business-level failure
/// reported by the target's GraphQL layer and must not be blindly
/// retried.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RpcError {
    /// Failed to establish or lost the broker connection. Fatal to all
    /// pending calls at the moment it occurs; recoverable only by a
    /// fresh connect.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The call's deadline elapsed with no reply. Local-only, does not
    /// affect other calls.
    #[error("timed out waiting for reply")]
    Timeout,

    /// The cap on concurrently outstanding calls was hit; the request
    /// was never published.
    #[error("too many outstanding calls (limit {limit})")]
    Overloaded { limit: usize },

    /// The remote handler executed but its GraphQL layer reported
    /// errors. Carries the original errors array.
    #[error("remote GraphQL error: {}", format_graphql_errors(.0))]
    Remote(Vec<GraphQLError>),

    /// A message could not be decoded, or local bookkeeping was
    /// violated (e.g. a correlation id collision).
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors returned while registering or running an RPC server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// A handler is already consuming this queue in this process.
    /// Registering twice is rejected, not replaced.
    #[error("handler already registered for queue '{queue}'")]
    HandlerAlreadyRegistered { queue: String },

    /// The connection is down; `receive` needs a live connection.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// Declaring or consuming the queue failed at the broker.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Broker-level failures reported by a [`crate::transport::Transport`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Failed to establish the broker connection.
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    /// The connection is closed; the transport must be recreated.
    #[error("broker connection closed")]
    Closed,

    /// Declaring a queue failed.
    #[error("failed to declare queue '{queue}': {reason}")]
    Declare { queue: String, reason: String },

    /// Publishing a message failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Starting a consumer failed.
    #[error("consume failed on queue '{queue}': {reason}")]
    Consume { queue: String, reason: String },
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        RpcError::Connection(err.to_string())
    }
}

fn format_graphql_errors(errors: &[GraphQLError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_formats_all_messages() {
        let err = RpcError::Remote(vec![
            GraphQLError::new("first"),
            GraphQLError::new("second"),
        ]);
        let text = err.to_string();
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }

    #[test]
    fn test_transport_error_maps_to_connection() {
        let err: RpcError = TransportError::Closed.into();
        assert!(matches!(err, RpcError::Connection(_)));
    }
}
