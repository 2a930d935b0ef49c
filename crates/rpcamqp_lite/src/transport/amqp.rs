use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection as AmqpConnection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::error::TransportError;
use crate::transport::{Delivery, Publish, QueueKind, Transport};

/// The production [`Transport`] over RabbitMQ.
///
/// One AMQP connection and one channel per process. Publishes from all
/// tasks are funneled through a single writer task that owns the
/// publish side of the channel, so interleaved concurrent publishes
/// never race regardless of driver guarantees.
#[derive(Clone)]
pub struct AmqpTransport {
    inner: Arc<AmqpInner>,
}

struct AmqpInner {
    connection: AmqpConnection,
    channel: Channel,
    publish_tx: mpsc::UnboundedSender<PublishJob>,
    closed_tx: watch::Sender<bool>,
}

struct PublishJob {
    publish: Publish,
    done: oneshot::Sender<Result<(), TransportError>>,
}

impl AmqpTransport {
    /// Connect to the broker and open the process's single channel.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let connection = AmqpConnection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (closed_tx, _) = watch::channel(false);
        {
            let closed_tx = closed_tx.clone();
            connection.on_error(move |err| {
                error!(error = %err, "AMQP connection error");
                let _ = closed_tx.send(true);
            });
        }

        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        tokio::spawn(publish_writer(channel.clone(), publish_rx));

        Ok(Self {
            inner: Arc::new(AmqpInner {
                connection,
                channel,
                publish_tx,
                closed_tx,
            }),
        })
    }
}

/// The single-writer publish loop. Owns all publishes on the channel.
async fn publish_writer(channel: Channel, mut jobs: mpsc::UnboundedReceiver<PublishJob>) {
    while let Some(job) = jobs.recv().await {
        let PublishJob { publish, done } = job;

        let mut properties =
            BasicProperties::default().with_content_type("application/json".to_string().into());
        if let Some(id) = publish.correlation_id {
            properties = properties.with_correlation_id(id.into());
        }
        if let Some(reply_to) = publish.reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }

        let result = async {
            let confirm = channel
                .basic_publish(
                    "",
                    &publish.queue,
                    BasicPublishOptions::default(),
                    &publish.payload,
                    properties,
                )
                .await
                .map_err(|e| TransportError::Publish(e.to_string()))?;
            confirm
                .await
                .map_err(|e| TransportError::Publish(e.to_string()))?;
            Ok(())
        }
        .await;

        let _ = done.send(result);
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_queue(
        &self,
        name: &str,
        kind: QueueKind,
    ) -> Result<String, TransportError> {
        let options = match kind {
            QueueKind::Work => QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            QueueKind::Reply => QueueDeclareOptions {
                exclusive: true,
                ..Default::default()
            },
        };

        let queue = self
            .inner
            .channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(|e| TransportError::Declare {
                queue: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(queue.name().as_str().to_string())
    }

    async fn publish(&self, publish: Publish) -> Result<(), TransportError> {
        let (done, done_rx) = oneshot::channel();
        self.inner
            .publish_tx
            .send(PublishJob { publish, done })
            .map_err(|_| TransportError::Closed)?;
        done_rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn consume(
        &self,
        queue: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, TransportError> {
        let consumer = self
            .inner
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        let closed_tx = self.inner.closed_tx.clone();

        tokio::spawn(async move {
            let mut consumer = consumer;
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            warn!(queue = %queue, error = %e, "failed to ack delivery");
                        }
                        let properties = &delivery.properties;
                        let out = Delivery {
                            payload: delivery.data.clone().into(),
                            correlation_id: properties
                                .correlation_id()
                                .as_ref()
                                .map(|s| s.as_str().to_string()),
                            reply_to: properties
                                .reply_to()
                                .as_ref()
                                .map(|s| s.as_str().to_string()),
                        };
                        if tx.send(out).is_err() {
                            debug!(queue = %queue, "consumer receiver dropped, stopping");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "consumer failed");
                        let _ = closed_tx.send(true);
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    async fn close(&self) {
        if let Err(e) = self.inner.connection.close(200, "bye").await {
            debug!(error = %e, "error closing AMQP connection");
        }
        let _ = self.inner.closed_tx.send(true);
    }
}
