//! The reply listener: one consume loop on the process-private reply
//! queue, dispatching each delivery to the pending call that owns its
//! correlation id.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::correlation::CorrelationId;
use crate::envelope::ReplyEnvelope;
use crate::pending::PendingCalls;
use crate::transport::Delivery;

/// Run the listener until the reply consumer closes. Dispatch is
/// synchronous and minimal (a map lookup plus a oneshot send), so the
/// loop never waits on a caller.
pub(crate) async fn run(
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    pending: Arc<PendingCalls>,
) {
    while let Some(delivery) = deliveries.recv().await {
        dispatch(&pending, delivery);
    }
    debug!("reply consumer closed");
}

fn dispatch(pending: &PendingCalls, delivery: Delivery) {
    let Some(id) = delivery.correlation_id else {
        debug!("reply without correlation id, discarding");
        return;
    };
    let id = CorrelationId::from(id);

    // Unknown id: the call timed out, was already resolved, or this is
    // a duplicate delivery. Discard; the ack already happened at the
    // transport so the queue cannot stall.
    if !pending.contains(&id) {
        debug!(correlation_id = %id, "no pending call for reply, discarding");
        return;
    }

    match ReplyEnvelope::decode(&delivery.payload) {
        Ok(reply) => {
            pending.resolve(&id, reply);
        }
        Err(err) => {
            warn!(correlation_id = %id, error = %err, "undecodable reply");
            pending.reject(&id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use bytes::Bytes;

    fn delivery(id: Option<&str>, payload: &str) -> Delivery {
        Delivery {
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            correlation_id: id.map(str::to_string),
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn test_dispatch_resolves_matching_call() {
        let pending = Arc::new(PendingCalls::new(16));
        let id = CorrelationId::generate();
        let (_guard, rx) = pending.register(id.clone()).unwrap();

        dispatch(&pending, delivery(Some(id.as_str()), r#"{"data":{"ok":true}}"#));

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.data, Some(serde_json::json!({ "ok": true })));
    }

    #[tokio::test]
    async fn test_dispatch_discards_unknown_id() {
        let pending = Arc::new(PendingCalls::new(16));
        dispatch(&pending, delivery(Some("nobody-waits"), r#"{"data":null}"#));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_discards_missing_id() {
        let pending = Arc::new(PendingCalls::new(16));
        dispatch(&pending, delivery(None, r#"{"data":null}"#));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_reply_rejects_the_call() {
        let pending = Arc::new(PendingCalls::new(16));
        let id = CorrelationId::generate();
        let (_guard, rx) = pending.register(id.clone()).unwrap();

        dispatch(&pending, delivery(Some(id.as_str()), "not json"));

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }
}
