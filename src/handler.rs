//! Defines the traits for message handling logic.

use crate::error::RetryError;
use crate::message::Message;
use async_trait::async_trait;
use serde::de::DeserializeOwned;

/// A trait for processing messages from a RabbitMQ queue.
///
/// Returning an error schedules the message for a delayed retry, or dead-letters it
/// once its retries are used up.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes a single delivered message.
    async fn handle_message(&self, message: &Message) -> Result<(), RetryError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

/// A handler for JSON payloads. Wrap it in [`Json`] to consume with it.
#[async_trait]
pub trait JsonMessageHandler: Send + Sync {
    /// The type of the message that this handler can process.
    type MessageType: DeserializeOwned + Send;

    async fn handle(&self, message: Self::MessageType) -> Result<(), RetryError>;

    fn handler_name(&self) -> &str;
}

/// Deserializes payloads before passing them to a [`JsonMessageHandler`].
///
/// A payload that does not deserialize fails like any other handler error.
pub struct Json<H>(pub H);

#[async_trait]
impl<H> MessageHandler for Json<H>
where
    H: JsonMessageHandler,
{
    async fn handle_message(&self, message: &Message) -> Result<(), RetryError> {
        let payload: H::MessageType = serde_json::from_slice(&message.data)?;
        self.0.handle(payload).await
    }

    fn handler_name(&self) -> &str {
        self.0.handler_name()
    }
}
