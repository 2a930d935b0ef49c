use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::envelope::{ReplyEnvelope, RequestEnvelope};
use crate::error::ServerError;
use crate::transport::{Delivery, Publish, QueueKind, Transport};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<ReplyEnvelope, anyhow::Error>> + Send>>;
type HandlerFn = Arc<dyn Fn(RequestEnvelope) -> HandlerFuture + Send + Sync>;

/// The serving side of the RPC protocol.
///
/// `receive` binds a handler — the local GraphQL executor — to this
/// service's work queue. Every consumed request produces exactly one
/// reply on the requester's reply queue, tagged with the original
/// correlation id: handler errors and panics are converted into
/// GraphQL-shaped error replies rather than ever leaving the caller
/// hanging or crashing the consume loop.
#[derive(Clone)]
pub struct RpcServer {
    conn: Connection,
}

impl RpcServer {
    pub fn new(conn: &Connection) -> Self {
        Self { conn: conn.clone() }
    }

    /// Declare `queue` and start consuming it with `handler`.
    ///
    /// At most one handler per queue name per process; a second
    /// registration is rejected, not replaced. Requests are handled in
    /// spawned tasks, so a handler may itself issue calls to other
    /// services (cycles across services are legal as long as the
    /// business logic terminates).
    pub async fn receive<F, Fut>(&self, queue: &str, handler: F) -> Result<(), ServerError>
    where
        F: Fn(RequestEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReplyEnvelope, anyhow::Error>> + Send + 'static,
    {
        use dashmap::mapref::entry::Entry;

        if !self.conn.is_connected() {
            return Err(ServerError::Connection("connection is down".to_string()));
        }

        match self.conn.served_queues().entry(queue.to_string()) {
            Entry::Occupied(_) => {
                return Err(ServerError::HandlerAlreadyRegistered {
                    queue: queue.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        if let Err(err) = self
            .conn
            .transport()
            .declare_queue(queue, QueueKind::Work)
            .await
        {
            self.conn.served_queues().remove(queue);
            return Err(err.into());
        }
        let deliveries = match self.conn.transport().consume(queue).await {
            Ok(rx) => rx,
            Err(err) => {
                self.conn.served_queues().remove(queue);
                return Err(err.into());
            }
        };

        let handler: HandlerFn = Arc::new(move |req| Box::pin(handler(req)) as HandlerFuture);
        let transport = Arc::clone(self.conn.transport());
        let queue = queue.to_string();
        info!(queue = %queue, "handler registered, consuming requests");
        tokio::spawn(consume_loop(transport, queue, handler, deliveries));

        Ok(())
    }
}

async fn consume_loop(
    transport: Arc<dyn Transport>,
    queue: String,
    handler: HandlerFn,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = deliveries.recv().await {
        // Each request runs in its own task; the loop never waits on a
        // handler, and nested calls cannot deadlock the consumer.
        tokio::spawn(handle_request(
            Arc::clone(&transport),
            queue.clone(),
            Arc::clone(&handler),
            delivery,
        ));
    }
    debug!(queue = %queue, "request consumer closed");
}

async fn handle_request(
    transport: Arc<dyn Transport>,
    queue: String,
    handler: HandlerFn,
    delivery: Delivery,
) {
    let Some(reply_to) = delivery.reply_to.clone() else {
        warn!(queue = %queue, "request without reply_to, dropping");
        return;
    };
    let correlation_id = delivery.correlation_id.clone();

    let reply = match RequestEnvelope::decode(&delivery.payload) {
        Ok(request) => run_handler(handler, request).await,
        Err(err) => {
            warn!(queue = %queue, error = %err, "malformed request");
            ReplyEnvelope::error(format!("malformed request: {err}"))
        }
    };

    let payload = reply.encode().unwrap_or_else(|err| {
        warn!(queue = %queue, error = %err, "failed to encode reply");
        br#"{"errors":[{"message":"reply encoding failed"}]}"#.to_vec()
    });

    // The reply queue may already be gone (caller timed out and
    // disconnected); that is not the server's problem.
    if let Err(err) = transport
        .publish(Publish {
            queue: reply_to.clone(),
            payload: Bytes::from(payload),
            correlation_id,
            reply_to: None,
        })
        .await
    {
        warn!(queue = %queue, reply_to = %reply_to, error = %err, "failed to publish reply");
    }
}

/// Run the handler, converting failure and panic alike into an error
/// reply so the requester always hears back.
async fn run_handler(handler: HandlerFn, request: RequestEnvelope) -> ReplyEnvelope {
    match tokio::spawn(handler(request)).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => ReplyEnvelope::error(err.to_string()),
        Err(join_err) if join_err.is_panic() => {
            let panic = join_err.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            ReplyEnvelope::error(format!("handler panicked: {message}"))
        }
        Err(_) => ReplyEnvelope::error("handler aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> RequestEnvelope {
        RequestEnvelope::new("{ ping }", json!(null))
    }

    #[tokio::test]
    async fn test_handler_success_passes_through() {
        let handler: HandlerFn =
            Arc::new(|_req| Box::pin(async { Ok(ReplyEnvelope::ok(json!({ "pong": true }))) }));
        let reply = run_handler(handler, request()).await;
        assert!(!reply.is_err());
        assert_eq!(reply.data, Some(json!({ "pong": true })));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_reply() {
        let handler: HandlerFn =
            Arc::new(|_req| Box::pin(async { Err(anyhow::anyhow!("database unavailable")) }));
        let reply = run_handler(handler, request()).await;
        assert!(reply.is_err());
        let errors = reply.errors.unwrap();
        assert_eq!(errors[0].message, "database unavailable");
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error_reply() {
        let handler: HandlerFn = Arc::new(|_req| {
            Box::pin(async {
                if true {
                    panic!("index out of bounds");
                }
                Ok(ReplyEnvelope::ok(serde_json::Value::Null))
            })
        });
        let reply = run_handler(handler, request()).await;
        assert!(reply.is_err());
        let errors = reply.errors.unwrap();
        assert!(errors[0].message.contains("index out of bounds"));
    }
}
