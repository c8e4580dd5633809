#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;
use rabbitmq_retry::{
    Delivery, DeliveryStream, Message, MessageHandler, RetryChannel, RetryError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub const TEST_QUEUE: &str = "test.q";

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// A broker operation recorded by [`MockChannel`].
#[derive(Debug, Clone)]
pub enum Event {
    Published {
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        properties: BasicProperties,
    },
    Acked(u64),
    Nacked(u64),
    Rejected { delivery_tag: u64, requeue: bool },
}

/// In-memory channel: deliveries are pushed by the test, broker operations are
/// recorded in call order.
pub struct MockChannel {
    queues: Mutex<HashMap<String, Option<mpsc::UnboundedSender<Delivery>>>>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
    next_tag: AtomicU64,
    fail_acks: AtomicBool,
    fail_publishes: AtomicBool,
    fail_rejects: AtomicBool,
}

impl MockChannel {
    pub fn with_queue(queue_name: &str) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut queues = HashMap::new();
        queues.insert(queue_name.to_string(), None);
        Self {
            queues: Mutex::new(queues),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            next_tag: AtomicU64::new(1),
            fail_acks: AtomicBool::new(false),
            fail_publishes: AtomicBool::new(false),
            fail_rejects: AtomicBool::new(false),
        }
    }

    pub fn fail_acks(&self) {
        self.fail_acks.store(true, Ordering::SeqCst);
    }

    pub fn fail_publishes(&self) {
        self.fail_publishes.store(true, Ordering::SeqCst);
    }

    pub fn fail_rejects(&self) {
        self.fail_rejects.store(true, Ordering::SeqCst);
    }

    /// Delivers a message to the consumer of `queue_name`, optionally carrying a
    /// retry header. Returns its delivery tag.
    pub fn send_to_queue(&self, queue_name: &str, retries: Option<AMQPValue>) -> u64 {
        let properties = match retries {
            Some(value) => {
                let mut headers = FieldTable::default();
                headers.insert("x-retries".into(), value);
                BasicProperties::default().with_headers(headers)
            }
            None => BasicProperties::default(),
        };
        self.send_message(queue_name, b"{}".to_vec(), properties)
    }

    pub fn send_message(
        &self,
        queue_name: &str,
        payload: Vec<u8>,
        properties: BasicProperties,
    ) -> u64 {
        let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let message =
            Message::new(delivery_tag, queue_name, payload).with_properties(properties);
        self.push(queue_name, Delivery::Message(message));
        delivery_tag
    }

    /// Signals that the server closed the consumer, like amqplib's null message.
    pub fn close_consumer(&self, queue_name: &str) {
        self.push(queue_name, Delivery::ConsumerClosed);
    }

    /// Ends the delivery stream without a closure signal.
    pub fn finish(&self, queue_name: &str) {
        if let Some(slot) = self.queues.lock().unwrap().get_mut(queue_name) {
            slot.take();
        }
    }

    pub async fn next_event(&self) -> Event {
        let mut events = self.events_rx.lock().await;
        tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for a broker operation")
            .expect("event channel closed")
    }

    pub async fn try_next_event(&self) -> Option<Event> {
        self.events_rx.lock().await.try_recv().ok()
    }

    fn push(&self, queue_name: &str, delivery: Delivery) {
        let queues = self.queues.lock().unwrap();
        let sender = queues
            .get(queue_name)
            .and_then(|slot| slot.as_ref())
            .expect("no consumer registered on queue");
        sender.send(delivery).expect("consumer stream dropped");
    }

    fn record(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl RetryChannel for MockChannel {
    async fn consume(&self, queue_name: &str) -> Result<DeliveryStream, RetryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut queues = self.queues.lock().unwrap();
            let slot = queues
                .get_mut(queue_name)
                .ok_or_else(|| format!("Consuming from non-existing queue: {}", queue_name))?;
            *slot = Some(tx);
        }

        let deliveries =
            stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|d| (d, rx)) });
        Ok(deliveries.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), RetryError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err("Publish refused".into());
        }
        self.record(Event::Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            properties,
        });
        Ok(())
    }

    async fn ack(&self, message: &Message) -> Result<(), RetryError> {
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err("Woops!".into());
        }
        self.record(Event::Acked(message.delivery_tag));
        Ok(())
    }

    async fn nack(&self, message: &Message) -> Result<(), RetryError> {
        self.record(Event::Nacked(message.delivery_tag));
        Ok(())
    }

    async fn reject(&self, message: &Message, requeue: bool) -> Result<(), RetryError> {
        if self.fail_rejects.load(Ordering::SeqCst) {
            return Err("Reject refused".into());
        }
        self.record(Event::Rejected {
            delivery_tag: message.delivery_tag,
            requeue,
        });
        Ok(())
    }
}

/// Reads the `x-retries` header of a published copy.
pub fn retries_header(properties: &BasicProperties) -> Option<AMQPValue> {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get("x-retries").cloned())
}

pub struct FailingHandler {
    pub calls: AtomicUsize,
}

impl FailingHandler {
    pub fn new() -> Self {
        Self { calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle_message(&self, _message: &Message) -> Result<(), RetryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err("Go Boom".into())
    }

    fn handler_name(&self) -> &str {
        "FailingHandler"
    }
}

pub struct SucceedingHandler;

#[async_trait]
impl MessageHandler for SucceedingHandler {
    async fn handle_message(&self, _message: &Message) -> Result<(), RetryError> {
        Ok(())
    }

    fn handler_name(&self) -> &str {
        "SucceedingHandler"
    }
}

pub struct PanickingHandler;

#[async_trait]
impl MessageHandler for PanickingHandler {
    async fn handle_message(&self, _message: &Message) -> Result<(), RetryError> {
        panic!("handler blew up");
    }

    fn handler_name(&self) -> &str {
        "PanickingHandler"
    }
}

/// Holds messages whose payload is `b"slow"` until [`GatedHandler::release`], then
/// fails or succeeds every message according to `fail`.
pub struct GatedHandler {
    gate: Notify,
    fail: bool,
}

impl GatedHandler {
    pub fn new(fail: bool) -> Self {
        Self {
            gate: Notify::new(),
            fail,
        }
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl MessageHandler for GatedHandler {
    async fn handle_message(&self, message: &Message) -> Result<(), RetryError> {
        if message.data == b"slow" {
            self.gate.notified().await;
        }
        if self.fail {
            Err("Go Boom".into())
        } else {
            Ok(())
        }
    }

    fn handler_name(&self) -> &str {
        "GatedHandler"
    }
}

/// Drains the recorded events and counts the terminal actions per delivery tag.
pub async fn terminal_actions(channel: &MockChannel) -> HashMap<u64, usize> {
    let mut actions = HashMap::new();
    while let Some(event) = channel.try_next_event().await {
        let tag = match event {
            Event::Acked(tag) | Event::Nacked(tag) => tag,
            Event::Rejected { delivery_tag, .. } => delivery_tag,
            Event::Published { .. } => continue,
        };
        *actions.entry(tag).or_insert(0) += 1;
    }
    actions
}
