//! Messages as seen by the consumer, and the signals a consumer stream carries.

use lapin::{
    types::{AMQPValue, FieldTable},
    BasicProperties,
};

/// A delivered message.
///
/// The retrying consumer never changes a delivered message: it only acknowledges,
/// nacks or rejects it, and retries go out as a new copy.
#[derive(Debug, Clone)]
pub struct Message {
    /// Channel-scoped tag used to acknowledge the delivery.
    pub delivery_tag: u64,
    /// The queue the message was consumed from.
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl Message {
    /// Creates a message as delivered straight to `queue` through the default exchange.
    pub fn new(delivery_tag: u64, queue: impl Into<String>, data: Vec<u8>) -> Self {
        let queue = queue.into();
        Self {
            delivery_tag,
            routing_key: queue.clone(),
            queue,
            exchange: String::new(),
            redelivered: false,
            properties: BasicProperties::default(),
            data,
        }
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Converts a `lapin` delivery received from `queue`.
    pub fn from_delivery(queue: &str, delivery: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            queue: queue.to_string(),
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }

    pub fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    /// Properties for the retry copy: identical to this message's, with `header_name`
    /// set to `retry_count`.
    pub fn retry_properties(&self, header_name: &str, retry_count: u32) -> BasicProperties {
        let mut headers = self.headers().cloned().unwrap_or_default();
        headers.insert(
            header_name.into(),
            AMQPValue::LongLongInt(i64::from(retry_count)),
        );
        self.properties.clone().with_headers(headers)
    }
}

/// An item of a consumer stream.
#[derive(Debug, Clone)]
pub enum Delivery {
    Message(Message),
    /// The server terminated the consumer registration.
    ConsumerClosed,
}
