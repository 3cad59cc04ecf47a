use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::error::{AckError, ConnectError};
use crate::transcode::ContentEncoding;

/// Final disposition of a delivery at the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), AckError>;

    /// Reject without requeue.
    async fn reject(self: Box<Self>) -> Result<(), AckError>;
}

/// One message taken off the queue. Finalizing it consumes it, so a delivery is
/// acknowledged or rejected at most once.
pub struct Delivery {
    pub tag: u64,
    pub payload: Vec<u8>,
    pub encoding: ContentEncoding,
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        tag: u64,
        payload: Vec<u8>,
        encoding: ContentEncoding,
        redelivered: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            tag,
            payload,
            encoding,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), AckError> {
        self.acker.ack().await
    }

    pub async fn reject(self) -> Result<(), AckError> {
        self.acker.reject().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("bytes", &self.payload.len())
            .field("encoding", &self.encoding)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

struct BrokerAcker {
    tag: u64,
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledge for BrokerAcker {
    async fn ack(self: Box<Self>) -> Result<(), AckError> {
        let tag = self.tag;
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|error| AckError::Broker { tag, error })
    }

    async fn reject(self: Box<Self>) -> Result<(), AckError> {
        let tag = self.tag;
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ())
            .map_err(|error| AckError::Broker { tag, error })
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        let encoding = ContentEncoding::from_marker(
            delivery
                .properties
                .content_encoding()
                .as_ref()
                .map(|marker| marker.as_str()),
        );
        Delivery::new(
            delivery.delivery_tag,
            delivery.data,
            encoding,
            delivery.redelivered,
            Box::new(BrokerAcker {
                tag: delivery.delivery_tag,
                acker: delivery.acker,
            }),
        )
    }
}

/// The consumer's deliveries, shared by every worker. Each delivery is handed to
/// exactly one caller of `next`.
#[derive(Clone)]
pub struct DeliveryStream {
    inner: Arc<Mutex<BoxStream<'static, Result<Delivery, lapin::Error>>>>,
}

impl DeliveryStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Delivery, lapin::Error>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(stream.boxed())),
        }
    }

    /// Wait for the next delivery. `None` once the consumer is cancelled.
    pub async fn next(&self) -> Option<Result<Delivery, lapin::Error>> {
        self.inner.lock().await.next().await
    }
}

/// Deliveries the broker may push ahead of acknowledgement: two per worker.
pub fn prefetch_count(workers: usize) -> Result<u16, ConnectError> {
    let prefetch = workers.saturating_mul(2);
    u16::try_from(prefetch).map_err(|_| ConnectError::PrefetchOverflow(prefetch))
}

pub fn amqp_uri(config: &BrokerConfig) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.user.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.amqp_port,
        },
        vhost: config.namespace.as_str().to_owned(),
        ..Default::default()
    }
}

/// The URI without credentials, for logs and errors.
fn display_uri(config: &BrokerConfig) -> String {
    format!(
        "amqp://{}@{}:{}/{}",
        config.user,
        config.host,
        config.amqp_port,
        config.namespace.as_str()
    )
}

/// A connection with one channel consuming the exchange's queue.
pub struct BrokerConsumer {
    connection: Connection,
    channel: Channel,
    deliveries: DeliveryStream,
    closed: AtomicBool,
}

impl BrokerConsumer {
    /// Connect, declare the durable direct exchange and its queue, bind them with an
    /// empty routing key, and start consuming with manual acknowledgement.
    pub async fn connect(config: &BrokerConfig, workers: usize) -> Result<Self, ConnectError> {
        let prefetch = prefetch_count(workers)?;
        let exchange = config.exchange.as_str();
        let queue = config.queue();

        let connection =
            Connection::connect_uri(amqp_uri(config), ConnectionProperties::default())
                .await
                .map_err(|error| ConnectError::Connection {
                    uri: display_uri(config),
                    error,
                })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(ConnectError::Channel)?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|error| ConnectError::Topology {
                step: "set prefetch",
                error,
            })?;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|error| ConnectError::Topology {
                step: "declare exchange",
                error,
            })?;
        channel
            .queue_declare(&queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|error| ConnectError::Topology {
                step: "declare queue",
                error,
            })?;
        channel
            .queue_bind(
                &queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|error| ConnectError::Topology {
                step: "bind queue",
                error,
            })?;

        let consumer = channel
            .basic_consume(
                &queue,
                &format!("hec-forwarder-{}", std::process::id()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|error| ConnectError::Topology {
                step: "start consuming",
                error,
            })?;

        info!(
            "consuming {} from exchange {} on {} with prefetch {}",
            queue,
            exchange,
            display_uri(config),
            prefetch
        );

        Ok(Self {
            connection,
            channel,
            deliveries: DeliveryStream::new(
                consumer.map(|delivery| delivery.map(Delivery::from)),
            ),
            closed: AtomicBool::new(false),
        })
    }

    pub fn deliveries(&self) -> DeliveryStream {
        self.deliveries.clone()
    }

    /// Close the channel, then the connection. Unacknowledged deliveries go back to
    /// the queue. Closing twice only logs.
    pub async fn close(&self) -> Result<(), lapin::Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!("broker consumer already closed");
            return Ok(());
        }

        let channel = self.channel.close(200, "OK").await;
        let connection = self.connection.close(200, "OK").await;
        channel.and(connection)
    }
}
