use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::TransportError;
use crate::transport::{Delivery, Publish, QueueKind, Transport};

/// An in-process broker with the same point-to-point semantics the
/// AMQP transport relies on: publishing to a named queue delivers to
/// the single consumer registered on that name, and exclusive reply
/// queues are private to the transport that declared them.
///
/// Used by the test suite; also usable to embed several "services" in
/// one process without a broker.
pub struct MemoryBroker {
    queues: DashMap<String, QueueState, ahash::RandomState>,
    reply_seq: AtomicU64,
}

struct QueueState {
    tx: mpsc::UnboundedSender<Delivery>,
    // Taken by the first (only) consumer of the queue.
    rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::default(),
            reply_seq: AtomicU64::new(0),
        })
    }

    /// Create a transport handle representing one process's connection
    /// to this broker.
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            broker: Arc::clone(self),
            inner: Arc::new(TransportInner {
                closed_tx: watch::channel(false).0,
                owned_queues: Mutex::new(Vec::new()),
            }),
        }
    }

    fn declare(&self, name: String) -> String {
        self.queues.entry(name.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            QueueState {
                tx,
                rx: Mutex::new(Some(rx)),
            }
        });
        name
    }

    fn route(&self, publish: Publish) {
        let delivery = Delivery {
            payload: publish.payload,
            correlation_id: publish.correlation_id,
            reply_to: publish.reply_to,
        };
        match self.queues.get(&publish.queue) {
            Some(state) => {
                // A consumer that went away takes its queue with it.
                if state.tx.send(delivery).is_err() {
                    debug!(queue = %publish.queue, "consumer gone, message dropped");
                }
            }
            // Unroutable messages are dropped, like the default
            // exchange drops them.
            None => debug!(queue = %publish.queue, "no such queue, message dropped"),
        }
    }

    fn remove(&self, name: &str) {
        self.queues.remove(name);
    }
}

/// One process's connection to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    inner: Arc<TransportInner>,
}

struct TransportInner {
    closed_tx: watch::Sender<bool>,
    owned_queues: Mutex<Vec<String>>,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if *self.inner.closed_tx.borrow() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_queue(
        &self,
        name: &str,
        kind: QueueKind,
    ) -> Result<String, TransportError> {
        self.ensure_open()?;

        let name = match kind {
            QueueKind::Work => self.broker.declare(name.to_string()),
            QueueKind::Reply => {
                let seq = self.broker.reply_seq.fetch_add(1, Ordering::Relaxed);
                self.broker.declare(format!("amq.gen-{seq}"))
            }
        };

        self.inner
            .owned_queues
            .lock()
            .expect("owned queue list poisoned")
            .push(name.clone());
        Ok(name)
    }

    async fn publish(&self, publish: Publish) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker.route(publish);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, TransportError> {
        self.ensure_open()?;

        let state = self
            .broker
            .queues
            .get(queue)
            .ok_or_else(|| TransportError::Consume {
                queue: queue.to_string(),
                reason: "no such queue".to_string(),
            })?;

        state
            .rx
            .lock()
            .expect("queue receiver slot poisoned")
            .take()
            .ok_or_else(|| TransportError::Consume {
                queue: queue.to_string(),
                reason: "queue already has a consumer".to_string(),
            })
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    async fn close(&self) {
        let _ = self.inner.closed_tx.send(true);
        let owned: Vec<String> = self
            .inner
            .owned_queues
            .lock()
            .expect("owned queue list poisoned")
            .drain(..)
            .collect();
        for name in owned {
            self.broker.remove(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn publish_to(queue: &str, payload: &str) -> Publish {
        Publish {
            queue: queue.to_string(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            correlation_id: Some("c-1".to_string()),
            reply_to: Some("amq.gen-0".to_string()),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_single_consumer() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();

        transport.declare_queue("api-user", QueueKind::Work).await.unwrap();
        let mut rx = transport.consume("api-user").await.unwrap();

        transport.publish(publish_to("api-user", "{}")).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(delivery.reply_to.as_deref(), Some("amq.gen-0"));
    }

    #[tokio::test]
    async fn test_unroutable_message_is_dropped() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        // Publishing to an unknown queue succeeds and goes nowhere.
        transport.publish(publish_to("nowhere", "{}")).await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_queues_get_unique_names() {
        let broker = MemoryBroker::new();
        let a = broker.transport();
        let b = broker.transport();
        let qa = a.declare_queue("", QueueKind::Reply).await.unwrap();
        let qb = b.declare_queue("", QueueKind::Reply).await.unwrap();
        assert_ne!(qa, qb);
    }

    #[tokio::test]
    async fn test_second_consumer_is_rejected() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        transport.declare_queue("api-event", QueueKind::Work).await.unwrap();
        let _rx = transport.consume("api-event").await.unwrap();

        let err = transport.consume("api-event").await.unwrap_err();
        assert!(matches!(err, TransportError::Consume { .. }));
    }

    #[tokio::test]
    async fn test_close_flips_watch_and_drops_queues() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        let reply = transport.declare_queue("", QueueKind::Reply).await.unwrap();
        let mut rx = transport.consume(&reply).await.unwrap();
        let mut closed = transport.closed();
        assert!(!*closed.borrow_and_update());

        transport.close().await;

        assert!(*closed.borrow_and_update());
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            transport.publish(publish_to(&reply, "{}")).await,
            Err(TransportError::Closed)
        ));
    }
}
