//! Retry policy and the decision taken for a failed message.

use crate::message::Message;
use lapin::types::{AMQPValue, FieldTable};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Header carrying the number of retries a message has already been through.
pub const DEFAULT_RETRY_HEADER: &str = "x-retries";

/// Prefix of the delayed routes that hold a message before redelivery.
pub const DEFAULT_ROUTE_PREFIX: &str = "delayed.retry";

/// Builds the delayed route name for a queue and a backoff delay.
pub type RouteNameFn = dyn Fn(&str, Duration) -> String + Send + Sync;

/// Default route naming: `delayed.retry.<queue>.<seconds>s`.
///
/// Existing broker topology relies on this exact format.
pub fn default_route_name(queue_name: &str, delay: Duration) -> String {
    format!("{}.{}.{}s", DEFAULT_ROUTE_PREFIX, queue_name, delay.as_secs())
}

/// The delays used when none are configured: 5s, 10s, 20s, 40s.
pub fn default_delays() -> Vec<Duration> {
    vec![
        Duration::from_secs(5),
        Duration::from_secs(10),
        Duration::from_secs(20),
        Duration::from_secs(40),
    ]
}

/// What to do with a message whose handler failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Publish a copy to `route` with the retry counter set to `next_count`.
    Retry {
        route: String,
        delay: Duration,
        next_count: u32,
    },
    /// Reject the message without requeueing so the broker dead-letters it.
    DeadLetter,
}

/// Backoff schedule for failed messages. Immutable once built.
///
/// The retry counter indexes straight into the delay list: a message that has been
/// retried `n` times is retried next with `delays[n]`, and once `n` reaches the length
/// of the list it is dead-lettered.
#[derive(Clone)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
    header_name: String,
    route_name: Arc<RouteNameFn>,
}

impl RetryPolicy {
    /// Creates a new `RetryPolicyBuilder`.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Number of retries before a message is dead-lettered.
    pub fn max_retries(&self) -> u32 {
        saturating_count(self.delays.len())
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// Returns the delayed route for `queue_name` and `delay`.
    pub fn route_for(&self, queue_name: &str, delay: Duration) -> String {
        (self.route_name)(queue_name, delay)
    }

    /// Reads the retry counter from message headers.
    ///
    /// A missing header, or one that is not a non-negative whole number, reads as 0.
    pub fn retry_count(&self, headers: Option<&FieldTable>) -> u32 {
        headers
            .and_then(|headers| headers.inner().get(self.header_name.as_str()))
            .and_then(count_from_value)
            .unwrap_or(0)
    }

    /// Decides the next step for a message on `queue_name` that has been retried
    /// `retry_count` times.
    pub fn decide(&self, queue_name: &str, retry_count: u32) -> RetryDecision {
        match self.delays.get(retry_count as usize) {
            Some(&delay) => RetryDecision::Retry {
                route: self.route_for(queue_name, delay),
                delay,
                next_count: retry_count + 1,
            },
            None => RetryDecision::DeadLetter,
        }
    }

    /// Decides the next step for a failed delivery, reading its counter from the headers.
    pub fn decide_for(&self, message: &Message) -> RetryDecision {
        self.decide(&message.queue, self.retry_count(message.headers()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("delays", &self.delays)
            .field("header_name", &self.header_name)
            .finish_non_exhaustive()
    }
}

fn saturating_count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn count_from_value(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::Float(v) => whole_count(f64::from(*v)),
        AMQPValue::Double(v) => whole_count(*v),
        _ => None,
    }
}

fn whole_count(v: f64) -> Option<u32> {
    if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= f64::from(u32::MAX) {
        Some(v as u32)
    } else {
        None
    }
}

/// A builder for creating `RetryPolicy` instances.
#[derive(Default)]
pub struct RetryPolicyBuilder {
    delays: Option<Vec<Duration>>,
    header_name: Option<String>,
    route_name: Option<Arc<RouteNameFn>>,
}

impl RetryPolicyBuilder {
    /// Sets the backoff delays, one per retry.
    /// Defaults to 5s, 10s, 20s, 40s.
    pub fn delays(mut self, delays: Vec<Duration>) -> Self {
        self.delays = Some(delays);
        self
    }

    /// Sets the header holding the retry counter.
    /// Defaults to `x-retries`.
    pub fn header_name(mut self, header_name: impl Into<String>) -> Self {
        self.header_name = Some(header_name.into());
        self
    }

    /// Sets how delayed route names are derived from the queue name and delay.
    /// Defaults to [`default_route_name`].
    pub fn route_name<F>(mut self, route_name: F) -> Self
    where
        F: Fn(&str, Duration) -> String + Send + Sync + 'static,
    {
        let route_name: Arc<RouteNameFn> = Arc::new(route_name);
        self.route_name = Some(route_name);
        self
    }

    /// Builds the final `RetryPolicy`, applying defaults for any unset options.
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            delays: self.delays.unwrap_or_else(default_delays),
            header_name: self
                .header_name
                .unwrap_or_else(|| DEFAULT_RETRY_HEADER.to_string()),
            route_name: self
                .route_name
                .unwrap_or_else(|| Arc::new(default_route_name) as Arc<RouteNameFn>),
        }
    }
}
