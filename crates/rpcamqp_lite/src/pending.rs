use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::correlation::CorrelationId;
use crate::envelope::ReplyEnvelope;
use crate::error::RpcError;

/// The single source of truth for "who is waiting for what".
///
/// Maps correlation ids to the completion slot of the outstanding call
/// that owns them. Written by the RPC client (registrations) and the
/// reply listener (resolutions) concurrently; each id resolves or
/// rejects at most once, and a second resolution attempt is a no-op so
/// duplicate broker deliveries are harmless.
#[derive(Debug)]
pub struct PendingCalls {
    slots: DashMap<CorrelationId, PendingSlot, ahash::RandomState>,
    closed: AtomicBool,
    limit: usize,
}

#[derive(Debug)]
struct PendingSlot {
    tx: oneshot::Sender<Result<ReplyEnvelope, RpcError>>,
    created_at: Instant,
}

/// The receiving end of one pending call's completion slot.
pub type PendingReceiver = oneshot::Receiver<Result<ReplyEnvelope, RpcError>>;

impl PendingCalls {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: DashMap::default(),
            closed: AtomicBool::new(false),
            limit,
        }
    }

    /// Register a new outstanding call.
    ///
    /// Returns a guard that deregisters the call when dropped (the
    /// timeout path) and the receiver the caller awaits on. Fails with
    /// an overload error past the in-flight cap, and with a connection
    /// error once [`PendingCalls::reject_all`] has begun — a
    /// registration racing a teardown never leaks past it.
    pub fn register(
        self: &Arc<Self>,
        id: CorrelationId,
    ) -> Result<(PendingGuard, PendingReceiver), RpcError> {
        use dashmap::mapref::entry::Entry;

        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Connection("connection is down".to_string()));
        }
        if self.slots.len() >= self.limit {
            return Err(RpcError::Overloaded { limit: self.limit });
        }

        let (tx, rx) = oneshot::channel();
        match self.slots.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(RpcError::Protocol(format!(
                    "correlation id collision: {id}"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingSlot {
                    tx,
                    created_at: Instant::now(),
                });
            }
        }

        // Teardown may have started between the closed check and the
        // insert; re-check so the new slot cannot outlive it.
        if self.closed.load(Ordering::SeqCst) {
            if let Some((_, slot)) = self.slots.remove(&id) {
                let _ = slot
                    .tx
                    .send(Err(RpcError::Connection("connection is down".to_string())));
            }
            return Err(RpcError::Connection("connection is down".to_string()));
        }

        Ok((
            PendingGuard {
                id,
                registry: Arc::clone(self),
            },
            rx,
        ))
    }

    /// Resolve a pending call with the decoded reply.
    ///
    /// Returns `false` when no call owns the id — already resolved,
    /// timed out, or never known. That case is a no-op by design.
    pub fn resolve(&self, id: &CorrelationId, reply: ReplyEnvelope) -> bool {
        match self.slots.remove(id) {
            Some((_, slot)) => {
                // The caller may have given up between removal and
                // send; a dead receiver is fine.
                let _ = slot.tx.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Reject a pending call with the given error.
    pub fn reject(&self, id: &CorrelationId, err: RpcError) -> bool {
        match self.slots.remove(id) {
            Some((_, slot)) => {
                let _ = slot.tx.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Reject every outstanding call and refuse all future
    /// registrations. Invoked on connection teardown; safe to call
    /// concurrently with in-flight `register` calls and idempotent.
    pub fn reject_all(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<CorrelationId> = self.slots.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, slot)) = self.slots.remove(&id) {
                tracing::debug!(
                    correlation_id = %id,
                    age_ms = slot.created_at.elapsed().as_millis() as u64,
                    "rejecting pending call on teardown"
                );
                let _ = slot.tx.send(Err(RpcError::Connection(reason.to_string())));
            }
        }
    }

    /// The number of currently outstanding calls.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether a call is outstanding for the given id.
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.slots.contains_key(id)
    }
}

/// A guard holding one registration. When dropped before resolution
/// (timeout, publish failure), the registration is removed so a late
/// reply finds nothing and is discarded.
#[derive(Debug)]
pub struct PendingGuard {
    id: CorrelationId,
    registry: Arc<PendingCalls>,
}

impl PendingGuard {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        // No-op when the call already resolved; ids are never reused.
        self.registry.slots.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(limit: usize) -> Arc<PendingCalls> {
        Arc::new(PendingCalls::new(limit))
    }

    #[tokio::test]
    async fn test_resolve_delivers_reply() {
        let calls = registry(16);
        let id = CorrelationId::generate();
        let (_guard, rx) = calls.register(id.clone()).unwrap();

        assert!(calls.resolve(&id, ReplyEnvelope::ok(serde_json::json!({ "n": 1 }))));
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.data, Some(serde_json::json!({ "n": 1 })));
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_second_resolution_is_noop() {
        let calls = registry(16);
        let id = CorrelationId::generate();
        let (_guard, _rx) = calls.register(id.clone()).unwrap();

        assert!(calls.resolve(&id, ReplyEnvelope::ok(serde_json::Value::Null)));
        assert!(!calls.resolve(&id, ReplyEnvelope::ok(serde_json::Value::Null)));
        assert!(!calls.reject(&id, RpcError::Timeout));
    }

    #[tokio::test]
    async fn test_guard_drop_deregisters() {
        let calls = registry(16);
        let id = CorrelationId::generate();
        {
            let (_guard, _rx) = calls.register(id.clone()).unwrap();
            assert!(calls.contains(&id));
        }
        assert!(!calls.contains(&id));
        // A late reply for the dropped call is discarded.
        assert!(!calls.resolve(&id, ReplyEnvelope::ok(serde_json::Value::Null)));
    }

    #[tokio::test]
    async fn test_collision_is_rejected_not_overwritten() {
        let calls = registry(16);
        let id = CorrelationId::from("fixed");
        let (_guard, _rx) = calls.register(id.clone()).unwrap();

        let err = calls.register(id.clone()).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
        // The original registration is untouched.
        assert!(calls.contains(&id));
    }

    #[tokio::test]
    async fn test_overload_past_limit() {
        let calls = registry(2);
        let _a = calls.register(CorrelationId::generate()).unwrap();
        let _b = calls.register(CorrelationId::generate()).unwrap();

        let err = calls.register(CorrelationId::generate()).unwrap_err();
        assert!(matches!(err, RpcError::Overloaded { limit: 2 }));
    }

    #[tokio::test]
    async fn test_reject_all_empties_and_closes() {
        let calls = registry(16);
        let mut receivers = Vec::new();
        let mut guards = Vec::new();
        for _ in 0..3 {
            let (guard, rx) = calls.register(CorrelationId::generate()).unwrap();
            guards.push(guard);
            receivers.push(rx);
        }

        calls.reject_all("broker connection lost");
        assert!(calls.is_empty());

        for rx in receivers {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err, RpcError::Connection(_)));
        }

        // No registration leaks past a torn-down connection.
        let err = calls.register(CorrelationId::generate()).unwrap_err();
        assert!(matches!(err, RpcError::Connection(_)));
    }
}
