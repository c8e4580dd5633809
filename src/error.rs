use thiserror::Error;

/// Error type for the retrying consumer.
#[derive(Debug, Error)]
pub enum RetryError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// Error during message deserialization.
    #[error("Failed to deserialize message: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Custom messaging-related error.
    #[error("Messaging setup or configuration error: {message}")]
    MessagingError {
        message: String,
    },

    /// Error from the message handler logic.
    #[error("Message handler failed: {0}")]
    HandlerError(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// The broker cancelled the consumer for this queue.
    #[error("Consumer for queue '{queue}' was closed by the server")]
    ConsumerClosed { queue: String },

    /// Acknowledging a delivery failed; the delivery was nacked instead.
    #[error("Failed to acknowledge delivery {delivery_tag}: {source}")]
    AckFailed {
        delivery_tag: u64,
        #[source]
        source: Box<RetryError>,
    },

    /// Publishing the retry copy failed; the delivery was nacked instead.
    #[error("Failed to publish retry to '{route}': {source}")]
    RepublishFailed {
        route: String,
        #[source]
        source: Box<RetryError>,
    },

    /// A consumption or delivery task did not run to completion.
    #[error("Consumer task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

// Allow converting from a string-like type into a MessagingError
impl From<&str> for RetryError {
    fn from(s: &str) -> Self {
        RetryError::MessagingError { message: s.to_string() }
    }
}

impl From<String> for RetryError {
    fn from(s: String) -> Self {
        RetryError::MessagingError { message: s }
    }
}
