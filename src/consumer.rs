//! The retrying consumer: runs the handler for each delivery and settles it.

use crate::channel::{DeliveryStream, RetryChannel};
use crate::error::RetryError;
use crate::handler::MessageHandler;
use crate::message::{Delivery, Message};
use crate::retry::{RetryDecision, RetryPolicy};
use futures_util::{FutureExt, StreamExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// The handler succeeded and the delivery was acknowledged.
    Acked,
    /// A copy was published to `route` and the original acknowledged.
    Retried { route: String, retry_count: u32 },
    /// The delivery was rejected without requeue.
    DeadLettered,
}

/// Consumes queues through a [`RetryChannel`], retrying failed messages on delayed
/// routes and dead-lettering them once the policy's retries are used up.
pub struct RetryConsumer<C: RetryChannel> {
    channel: Arc<C>,
    policy: Arc<RetryPolicy>,
}

impl<C: RetryChannel> Clone for RetryConsumer<C> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<C: RetryChannel> RetryConsumer<C> {
    /// Creates a new consumer over `channel`.
    pub fn new(channel: Arc<C>, policy: RetryPolicy) -> Self {
        Self {
            channel,
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Registers a consumer on `queue_name` and processes its deliveries with `handler`
    /// on a background task.
    ///
    /// Registration errors are returned directly. Everything after that is reported
    /// through the returned [`ConsumptionHandle`]: it fails with
    /// [`RetryError::ConsumerClosed`] when the server closes the consumer, and with
    /// [`RetryError::AckFailed`] or [`RetryError::RepublishFailed`] when a delivery could
    /// not be finalized. Such a delivery fault does not stop consumption: the session
    /// keeps settling deliveries and reports the first fault once it ends. Handler
    /// failures never surface there; they are retried or dead-lettered.
    pub async fn consume<H>(
        &self,
        queue_name: &str,
        handler: Arc<H>,
    ) -> Result<ConsumptionHandle, RetryError>
    where
        H: MessageHandler + ?Sized + 'static,
    {
        let deliveries = self.channel.consume(queue_name).await?;

        log::info!(
            "Handler '{}' consuming queue '{}' with up to {} retries.",
            handler.handler_name(),
            queue_name,
            self.policy.max_retries()
        );

        let session = Session {
            queue_name: queue_name.to_string(),
            channel: self.channel.clone(),
            policy: self.policy.clone(),
            handler,
        };

        Ok(ConsumptionHandle {
            queue_name: queue_name.to_string(),
            task: tokio::spawn(session.run(deliveries)),
        })
    }
}

/// Completion of a consumption session started by [`RetryConsumer::consume`].
///
/// Resolves once the delivery stream ends or the server closes the consumer, after every
/// delivery taken from the stream has settled. The result is `Ok(())` only when no
/// closure signal arrived and no delivery faulted; otherwise it is the first error.
/// Dropping the handle leaves the session running.
#[must_use = "the handle reports consumer closure and delivery faults"]
pub struct ConsumptionHandle {
    queue_name: String,
    task: JoinHandle<Result<(), RetryError>>,
}

impl ConsumptionHandle {
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Future for ConsumptionHandle {
    type Output = Result<(), RetryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) => Err(RetryError::TaskFailed(e)),
        })
    }
}

struct Session<C: RetryChannel, H: MessageHandler + ?Sized> {
    queue_name: String,
    channel: Arc<C>,
    policy: Arc<RetryPolicy>,
    handler: Arc<H>,
}

impl<C, H> Session<C, H>
where
    C: RetryChannel,
    H: MessageHandler + ?Sized + 'static,
{
    async fn run(self, mut deliveries: DeliveryStream) -> Result<(), RetryError> {
        let mut in_flight = JoinSet::new();
        let mut failure = None;

        // A delivery fault ends only that delivery; the stream keeps being consumed so
        // every delivery still gets its terminal action.
        loop {
            tokio::select! {
                delivery = deliveries.next() => match delivery {
                    Some(Delivery::Message(message)) => {
                        let pending = PendingHandling {
                            message,
                            channel: self.channel.clone(),
                            policy: self.policy.clone(),
                        };
                        in_flight.spawn(pending.run(self.handler.clone()));
                    }
                    Some(Delivery::ConsumerClosed) => {
                        log::warn!(
                            "Consumer for queue '{}' was closed by the server.",
                            self.queue_name
                        );
                        self.record(
                            &mut failure,
                            RetryError::ConsumerClosed {
                                queue: self.queue_name.clone(),
                            },
                        );
                        break;
                    }
                    None => {
                        log::info!("Delivery stream for queue '{}' ended.", self.queue_name);
                        break;
                    }
                },
                Some(joined) = in_flight.join_next() => {
                    if let Err(e) = settled(joined) {
                        self.record(&mut failure, e);
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = settled(joined) {
                self.record(&mut failure, e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Keeps the first fault for the handle; later ones are only logged.
    fn record(&self, failure: &mut Option<RetryError>, error: RetryError) {
        if failure.is_none() {
            log::error!("Delivery fault on queue '{}': {}", self.queue_name, error);
            *failure = Some(error);
        } else {
            log::error!(
                "Additional delivery fault on queue '{}': {}",
                self.queue_name,
                error
            );
        }
    }
}

fn settled(joined: Result<Result<Settlement, RetryError>, JoinError>) -> Result<(), RetryError> {
    let settlement = joined??;
    log::debug!("Delivery settled: {:?}", settlement);
    Ok(())
}

/// One in-flight delivery. Every terminal step consumes it, so a delivery is settled
/// exactly once.
struct PendingHandling<C: RetryChannel> {
    message: Message,
    channel: Arc<C>,
    policy: Arc<RetryPolicy>,
}

impl<C: RetryChannel> PendingHandling<C> {
    async fn run<H>(self, handler: Arc<H>) -> Result<Settlement, RetryError>
    where
        H: MessageHandler + ?Sized,
    {
        let delivery_tag = self.message.delivery_tag;
        let outcome = AssertUnwindSafe(handler.handle_message(&self.message))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                log::info!("Message processed successfully. Tag: {}", delivery_tag);
                self.ack().await
            }
            Ok(Err(e)) => {
                log::warn!(
                    "Handler '{}' failed to process message. Tag: {}, Error: {}",
                    handler.handler_name(),
                    delivery_tag,
                    e
                );
                self.fail().await
            }
            Err(_) => {
                log::error!(
                    "Handler '{}' panicked while processing message. Tag: {}",
                    handler.handler_name(),
                    delivery_tag
                );
                self.fail().await
            }
        }
    }

    async fn fail(self) -> Result<Settlement, RetryError> {
        let decision = self.policy.decide_for(&self.message);
        match decision {
            RetryDecision::Retry {
                route,
                delay,
                next_count,
            } => self.retry(route, delay, next_count).await,
            RetryDecision::DeadLetter => self.dead_letter().await,
        }
    }

    async fn ack(self) -> Result<Settlement, RetryError> {
        match self.channel.ack(&self.message).await {
            Ok(()) => Ok(Settlement::Acked),
            Err(e) => Err(self.ack_failed(e).await),
        }
    }

    async fn retry(
        self,
        route: String,
        delay: Duration,
        next_count: u32,
    ) -> Result<Settlement, RetryError> {
        let properties = self
            .message
            .retry_properties(self.policy.header_name(), next_count);

        if let Err(e) = self
            .channel
            .publish(&route, &self.message.routing_key, &self.message.data, properties)
            .await
        {
            log::error!(
                "Failed to publish retry to '{}'. Tag: {}, Error: {}",
                route,
                self.message.delivery_tag,
                e
            );
            self.nack().await;
            return Err(RetryError::RepublishFailed {
                route,
                source: Box::new(e),
            });
        }

        // The retry copy stays published even if the ack below fails, so a nacked
        // original can be handled twice.
        if let Err(e) = self.channel.ack(&self.message).await {
            return Err(self.ack_failed(e).await);
        }

        log::info!(
            "Message scheduled for retry {} of {} on '{}' (delay: {:?}). Tag: {}",
            next_count,
            self.policy.max_retries(),
            route,
            delay,
            self.message.delivery_tag
        );
        Ok(Settlement::Retried {
            route,
            retry_count: next_count,
        })
    }

    async fn dead_letter(self) -> Result<Settlement, RetryError> {
        log::warn!(
            "Message dead-lettered after exhausting all {} retries. Tag: {}",
            self.policy.max_retries(),
            self.message.delivery_tag
        );

        if let Err(e) = self.channel.reject(&self.message, false).await {
            log::error!(
                "Failed to reject message. Tag: {}, Error: {}",
                self.message.delivery_tag,
                e
            );
            return Err(e);
        }
        Ok(Settlement::DeadLettered)
    }

    async fn ack_failed(&self, error: RetryError) -> RetryError {
        log::error!(
            "Failed to ack message, nacking it instead. Tag: {}, Error: {}",
            self.message.delivery_tag,
            error
        );
        self.nack().await;
        RetryError::AckFailed {
            delivery_tag: self.message.delivery_tag,
            source: Box::new(error),
        }
    }

    async fn nack(&self) {
        if let Err(e) = self.channel.nack(&self.message).await {
            log::error!(
                "Failed to nack message. Tag: {}, Error: {}",
                self.message.delivery_tag,
                e
            );
        }
    }
}
