use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{OnceCell, watch};
use tracing::{debug, info, warn};

use crate::config::RpcConfig;
use crate::error::{RpcError, TransportError};
use crate::listener;
use crate::pending::PendingCalls;
use crate::transport::{AmqpTransport, QueueKind, Transport};

/// Whether the broker connection under this handle is still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// The owner of a process's single broker connection.
///
/// Cheap to clone; all clones share the one connection, channel, reply
/// queue and pending-call registry. On connection loss the handle
/// transitions to [`ConnectionState::Disconnected`], every pending
/// call is rejected with a connection error, and the handle is dead
/// for good — create a new one with [`Connection::connect`], the
/// connection is never resumed in place.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingCalls>,
    config: RpcConfig,
    state_tx: watch::Sender<ConnectionState>,
    // Declared once by the first call; all clients share it.
    reply_queue: OnceCell<String>,
    // Queues this process has registered a handler on.
    served_queues: DashMap<String, (), ahash::RandomState>,
}

impl Connection {
    /// Connect to the AMQP broker named by the config.
    pub async fn connect(config: RpcConfig) -> Result<Self, TransportError> {
        let transport = AmqpTransport::connect(&config.url).await?;
        info!(url = %config.url, "connected to broker");
        Ok(Self::open(Arc::new(transport), config))
    }

    /// Build a connection over an already-established transport.
    /// This is how the in-memory broker is wired in.
    pub fn open(transport: Arc<dyn Transport>, config: RpcConfig) -> Self {
        let inner = Arc::new(ConnectionInner {
            pending: Arc::new(PendingCalls::new(config.max_in_flight)),
            config,
            state_tx: watch::channel(ConnectionState::Connected).0,
            reply_queue: OnceCell::new(),
            served_queues: DashMap::default(),
            transport,
        });

        // Watch the transport for connection loss. Holds only a weak
        // handle so an abandoned connection can be dropped.
        let weak = Arc::downgrade(&inner);
        let mut closed = inner.transport.closed();
        tokio::spawn(async move {
            loop {
                if *closed.borrow_and_update() {
                    break;
                }
                if closed.changed().await.is_err() {
                    return;
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.mark_disconnected("broker connection lost");
            }
        });

        Self { inner }
    }

    /// Declare the process-private reply queue and start the reply
    /// listener on it. Idempotent; the RPC client invokes this lazily
    /// on the first call. Returns the reply queue's name.
    pub async fn init_sending(&self) -> Result<String, RpcError> {
        self.ensure_connected()?;
        let inner = &self.inner;
        inner
            .reply_queue
            .get_or_try_init(|| async {
                let name = inner.transport.declare_queue("", QueueKind::Reply).await?;
                let deliveries = inner.transport.consume(&name).await?;
                tokio::spawn(listener::run(deliveries, Arc::clone(&inner.pending)));
                debug!(reply_queue = %name, "reply listener started");
                Ok::<_, RpcError>(name)
            })
            .await
            .cloned()
    }

    /// Close the connection. Safe with calls in flight: they are all
    /// rejected with a connection error.
    pub async fn disconnect(&self) {
        self.inner.transport.close().await;
        self.inner.mark_disconnected("disconnected");
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state_tx.borrow() == ConnectionState::Connected
    }

    /// Subscribe to connection state transitions. Flips to
    /// `Disconnected` exactly once, when the connection is lost or
    /// explicitly closed.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// The number of currently outstanding calls.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    pub(crate) fn ensure_connected(&self) -> Result<(), RpcError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RpcError::Connection("connection is down".to_string()))
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn pending(&self) -> &Arc<PendingCalls> {
        &self.inner.pending
    }

    pub(crate) fn served_queues(&self) -> &DashMap<String, (), ahash::RandomState> {
        &self.inner.served_queues
    }
}

impl ConnectionInner {
    fn mark_disconnected(&self, reason: &str) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                false
            } else {
                *state = ConnectionState::Disconnected;
                true
            }
        });
        if changed {
            warn!(reason = %reason, "connection down, rejecting pending calls");
            self.pending.reject_all(reason);
        }
    }
}
