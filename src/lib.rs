
//! # RabbitMQ Retry
//! Wraps a RabbitMQ channel so that messages whose handler fails are retried on delayed
//! routes with an increasing backoff, then dead-lettered.

pub mod channel;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod message;
pub mod retry;

// Re-export key components for easy access
pub use channel::{ChannelConfig, DeliveryStream, LapinChannel, RetryChannel};
pub use consumer::{ConsumptionHandle, RetryConsumer};
pub use error::RetryError;
pub use handler::{Json, JsonMessageHandler, MessageHandler};
pub use message::{Delivery, Message};
pub use retry::{RetryDecision, RetryPolicy};
