//! The broker contract the messaging core is layered on.
//!
//! A [`Transport`] offers named work queues with point-to-point
//! delivery (one consumer receives each message), exclusive auto-named
//! reply queues private to a process, and per-message
//! `correlation_id`/`reply_to` properties. Bodies are opaque bytes —
//! UTF-8 JSON at this crate's layer.
//!
//! [`AmqpTransport`] is the production implementation over RabbitMQ;
//! [`MemoryBroker`] is an in-process implementation used by the test
//! suite and for embedding without a broker.

mod amqp;
mod memory;

pub use amqp::AmqpTransport;
pub use memory::{MemoryBroker, MemoryTransport};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::error::TransportError;

/// How a queue should be declared on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// A durable, named work queue a service receives requests on.
    Work,
    /// An exclusive, auto-named, non-durable queue private to this
    /// connection; destroyed with it. Used for replies.
    Reply,
}

/// A message as delivered by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Bytes,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

/// An outbound message addressed to a named queue.
#[derive(Debug, Clone)]
pub struct Publish {
    pub queue: String,
    pub payload: Bytes,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Declare a queue, returning its broker-assigned name. Relevant
    /// for [`QueueKind::Reply`], where the broker picks the name.
    async fn declare_queue(&self, name: &str, kind: QueueKind)
    -> Result<String, TransportError>;

    /// Publish a message. Concurrent publishes from any task are safe;
    /// the implementation serializes them onto the channel.
    async fn publish(&self, publish: Publish) -> Result<(), TransportError>;

    /// Begin consuming a queue. Deliveries are acknowledged to the
    /// broker when handed over, giving at-least-once semantics overall;
    /// the reply path is idempotent against duplicates.
    async fn consume(
        &self,
        queue: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, TransportError>;

    /// A watch that flips to `true` when the connection is lost or
    /// closed. Never flips back.
    fn closed(&self) -> watch::Receiver<bool>;

    /// Close the connection, releasing exclusive queues and consumers.
    async fn close(&self);
}
