//! The broker operations the retrying consumer relies on, and their `lapin` implementation.

use crate::error::RetryError;
use crate::message::{Delivery, Message};
use async_trait::async_trait;
use futures_util::{
    future,
    stream::{self, BoxStream},
    StreamExt,
};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;

/// Deliveries pushed by the broker for one consumer registration.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// A channel to the broker.
///
/// Topology (exchanges, delayed routes, dead-letter bindings) must already exist;
/// nothing here declares it. Implementations must be safe to call concurrently from
/// several in-flight deliveries.
#[async_trait]
pub trait RetryChannel: Send + Sync + 'static {
    /// Registers a consumer on `queue_name`.
    ///
    /// The stream yields [`Delivery::ConsumerClosed`] if the server cancels the consumer.
    async fn consume(&self, queue_name: &str) -> Result<DeliveryStream, RetryError>;

    /// Publishes `payload` to `exchange` with the given routing key and properties.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), RetryError>;

    async fn ack(&self, message: &Message) -> Result<(), RetryError>;

    /// Negatively acknowledges `message`, asking the broker to requeue it.
    async fn nack(&self, message: &Message) -> Result<(), RetryError>;

    /// Rejects `message`. With `requeue` false the broker dead-letters it.
    async fn reject(&self, message: &Message, requeue: bool) -> Result<(), RetryError>;
}

/// Configuration for a `LapinChannel`.
///
/// Use the `ChannelConfig::builder()` method to construct this struct.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// The AMQP URL for connecting to the RabbitMQ broker.
    pub rabbitmq_url: String,
    /// Consumer tag to register with. Defaults to `{queue_name}_consumer` per queue.
    pub consumer_tag: Option<String>,
    /// The number of messages to fetch from the server at a time (QoS prefetch count).
    pub prefetch_count: u16,
}

impl ChannelConfig {
    /// Creates a new `ChannelConfigBuilder`.
    ///
    /// # Arguments
    /// * `rabbitmq_url` - The connection URL for the RabbitMQ broker.
    pub fn builder(rabbitmq_url: impl Into<String>) -> ChannelConfigBuilder {
        ChannelConfigBuilder::new(rabbitmq_url.into())
    }

    /// The consumer tag used when consuming `queue_name`.
    pub fn consumer_tag_for(&self, queue_name: &str) -> String {
        resolve_consumer_tag(self.consumer_tag.as_deref(), queue_name)
    }
}

fn resolve_consumer_tag(consumer_tag: Option<&str>, queue_name: &str) -> String {
    consumer_tag
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}_consumer", queue_name))
}

/// A builder for creating `ChannelConfig` instances.
pub struct ChannelConfigBuilder {
    rabbitmq_url: String,
    consumer_tag: Option<String>,
    prefetch_count: Option<u16>,
}

impl ChannelConfigBuilder {
    fn new(rabbitmq_url: String) -> Self {
        Self {
            rabbitmq_url,
            consumer_tag: None,
            prefetch_count: None,
        }
    }

    /// Sets a custom consumer tag.
    /// Defaults to `{queue_name}_consumer` if not set.
    pub fn consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    /// Sets a custom prefetch count (QoS).
    /// Defaults to 1.
    ///
    /// **Warning:** Setting this to a value greater than 1 means your `MessageHandler`
    /// may be called concurrently. Ensure your handler is thread-safe.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    pub fn build(self) -> ChannelConfig {
        ChannelConfig {
            rabbitmq_url: self.rabbitmq_url,
            consumer_tag: self.consumer_tag,
            prefetch_count: self.prefetch_count.unwrap_or(1),
        }
    }
}

/// A [`RetryChannel`] backed by a `lapin` channel.
#[derive(Clone)]
pub struct LapinChannel {
    channel: Channel,
    consumer_tag: Option<String>,
    // Held so the connection outlives the channel when opened through `connect`.
    _connection: Option<Arc<Connection>>,
}

impl LapinChannel {
    /// Wraps an already open channel.
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            consumer_tag: None,
            _connection: None,
        }
    }

    /// Connects to RabbitMQ, opens a channel and applies the QoS prefetch count.
    pub async fn connect(config: &ChannelConfig) -> Result<Self, RetryError> {
        log::info!("Connecting to RabbitMQ...");

        let connection =
            Connection::connect(&config.rabbitmq_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await?;
        log::info!("QoS prefetch count set to {}", config.prefetch_count);

        Ok(Self {
            channel,
            consumer_tag: config.consumer_tag.clone(),
            _connection: Some(Arc::new(connection)),
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl RetryChannel for LapinChannel {
    async fn consume(&self, queue_name: &str) -> Result<DeliveryStream, RetryError> {
        let consumer_tag = resolve_consumer_tag(self.consumer_tag.as_deref(), queue_name);

        let consumer = self
            .channel
            .basic_consume(
                queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        log::info!(
            "Consumer started with tag '{}' on queue '{}'.",
            consumer.tag().as_str(),
            queue_name
        );

        // lapin ends the stream when the server cancels the consumer.
        let queue = queue_name.to_string();
        let deliveries = consumer
            .map(move |delivery| match delivery {
                Ok(delivery) => Delivery::Message(Message::from_delivery(&queue, delivery)),
                Err(e) => {
                    log::error!("Consumer on queue '{}' failed: {}", queue, e);
                    Delivery::ConsumerClosed
                }
            })
            .chain(stream::once(future::ready(Delivery::ConsumerClosed)));

        Ok(deliveries.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), RetryError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn ack(&self, message: &Message) -> Result<(), RetryError> {
        self.channel
            .basic_ack(message.delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, message: &Message) -> Result<(), RetryError> {
        self.channel
            .basic_nack(
                message.delivery_tag,
                BasicNackOptions { requeue: true, ..Default::default() },
            )
            .await?;
        Ok(())
    }

    async fn reject(&self, message: &Message, requeue: bool) -> Result<(), RetryError> {
        self.channel
            .basic_reject(message.delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }
}
