use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// The wire body of an RPC request: a GraphQL operation to execute
/// against the target service's local schema.
///
/// The correlation id and reply queue name travel as broker message
/// properties, not in the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub query: String,
    #[serde(default)]
    pub variables: Value,
}

impl RequestEnvelope {
    pub fn new(query: impl Into<String>, variables: Value) -> Self {
        Self {
            query: query.into(),
            variables,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        serde_json::to_vec(self).map_err(|e| RpcError::Protocol(format!("encode request: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RpcError> {
        serde_json::from_slice(bytes).map_err(|e| RpcError::Protocol(format!("decode request: {e}")))
    }
}

/// The wire body of an RPC reply: the GraphQL execution result.
///
/// A reply with an absent or empty `errors` array is a success; any
/// entry in `errors` makes it a remote GraphQL failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphQLError>>,
}

impl ReplyEnvelope {
    /// A successful reply carrying the executor's `data`.
    pub fn ok(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: None,
        }
    }

    /// An error reply with a single GraphQL error entry.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            errors: Some(vec![GraphQLError::new(message)]),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        serde_json::to_vec(self).map_err(|e| RpcError::Protocol(format!("encode reply: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RpcError> {
        serde_json::from_slice(bytes).map_err(|e| RpcError::Protocol(format!("decode reply: {e}")))
    }

    /// Whether the reply carries at least one GraphQL error.
    pub fn is_err(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Convert into the caller-facing result: `data` on success,
    /// [`RpcError::Remote`] when the executor reported errors.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.errors {
            Some(errors) if !errors.is_empty() => Err(RpcError::Remote(errors)),
            _ => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

/// A single GraphQL-level error reported by the remote executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            extensions: None,
        }
    }
}
