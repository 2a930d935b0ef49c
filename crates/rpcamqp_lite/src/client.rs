use bytes::Bytes;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::connection::Connection;
use crate::correlation::CorrelationId;
use crate::envelope::RequestEnvelope;
use crate::error::RpcError;
use crate::transport::Publish;

/// The calling side of the RPC protocol.
///
/// `call` publishes a GraphQL operation to the target service's work
/// queue and suspends the calling task — only that task — until the
/// matching reply arrives, the deadline elapses, or the connection goes
/// down. Any number of calls may be in flight concurrently; a slow
/// target never delays unrelated calls.
#[derive(Clone)]
pub struct RpcClient {
    conn: Connection,
}

impl RpcClient {
    pub fn new(conn: &Connection) -> Self {
        Self { conn: conn.clone() }
    }

    /// Call a GraphQL operation on the service behind `target`, with
    /// the config's default timeout.
    ///
    /// Returns the decoded `data` on success. GraphQL-level errors in
    /// the reply surface as [`RpcError::Remote`], distinct from the
    /// transport failures ([`RpcError::Connection`],
    /// [`RpcError::Timeout`], [`RpcError::Overloaded`]).
    pub async fn call(
        &self,
        target: &str,
        query: &str,
        variables: Value,
    ) -> Result<Value, RpcError> {
        let timeout = self.conn.config().call_timeout;
        self.call_with_timeout(target, query, variables, timeout)
            .await
    }

    /// Like [`RpcClient::call`] with an explicit deadline.
    pub async fn call_with_timeout(
        &self,
        target: &str,
        query: &str,
        variables: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.conn.ensure_connected()?;
        let reply_queue = self.conn.init_sending().await?;

        let id = CorrelationId::generate();
        let (guard, rx) = self.conn.pending().register(id.clone())?;

        let payload = RequestEnvelope::new(query, variables).encode()?;
        self.conn
            .transport()
            .publish(Publish {
                queue: target.to_string(),
                payload: Bytes::from(payload),
                correlation_id: Some(id.to_string()),
                reply_to: Some(reply_queue),
            })
            .await?;

        debug!(queue = %target, correlation_id = %id, "request published");

        let outcome = tokio::time::timeout(timeout, rx).await;
        // The guard must outlive the await: it deregisters the call on
        // the timeout path so a late reply finds nothing.
        drop(guard);

        match outcome {
            Err(_elapsed) => {
                debug!(queue = %target, correlation_id = %id, "call timed out");
                Err(RpcError::Timeout)
            }
            // The sender side only disappears if the registry dropped
            // the slot without sending, which reject_all never does.
            Ok(Err(_recv)) => Err(RpcError::Connection("reply channel closed".to_string())),
            Ok(Ok(result)) => result?.into_result(),
        }
    }
}
