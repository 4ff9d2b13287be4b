use std::collections::BTreeMap;
use std::time::Duration;

/// An inbound message delivered to a consumer, or returned by [`Client::get`](crate::Client::get).
///
/// The minimal delivery surface a consuming application actually needs.
#[derive(Debug, Clone)]
pub struct Message {
    /// The raw message payload.
    pub payload: Vec<u8>,
    /// The exchange the message was published to (empty string for default exchange).
    pub exchange: String,
    /// The routing key the message was published with.
    pub routing_key: String,
    /// The broker-assigned delivery tag, used for ack/nack/reject.
    pub delivery_tag: u64,
    /// Whether the broker marked this as a redelivery.
    pub redelivered: bool,
    /// The `content-type` property, if present.
    pub content_type: Option<String>,
    /// The `correlation-id` property, if present.
    pub correlation_id: Option<String>,
    /// The `message-id` property, if present.
    pub message_id: Option<String>,
    /// The `reply-to` property, if present.
    pub reply_to: Option<String>,
    /// Custom headers attached to the message.
    pub headers: BTreeMap<String, String>,
}

/// Options accepted by `publish`/`send_to_queue`.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Marks the message for durable storage (`delivery_mode = 2`).
    pub persistent: bool,
    /// Requests that the broker return the message if it is unroutable.
    pub mandatory: bool,
    /// Per-call confirm timeout; defaults to 30s if unset.
    pub timeout: Option<Duration>,
    /// The `content-type` property to attach.
    pub content_type: Option<String>,
    /// The `correlation-id` property to attach.
    pub correlation_id: Option<String>,
    /// The `message-id` property to attach.
    pub message_id: Option<String>,
    /// The `reply-to` property to attach.
    pub reply_to: Option<String>,
    /// The `expiration` property (per-message TTL, milliseconds as a string).
    pub expiration: Option<String>,
    /// Custom headers to attach.
    pub headers: BTreeMap<String, String>,
}

impl PublishOptions {
    /// The default per-call publish confirm timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Resolves this option set's effective timeout.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(Self::DEFAULT_TIMEOUT)
    }
}

/// A single message queued for [`Client::publish_batch`](crate::Client::publish_batch).
#[derive(Debug, Clone)]
pub struct BatchMessage {
    /// The target exchange.
    pub exchange: String,
    /// The routing key.
    pub routing_key: String,
    /// The message payload.
    pub payload: Vec<u8>,
    /// Per-message publish options.
    pub options: PublishOptions,
}

/// Options accepted by `consume`.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Whether the consumer settles messages manually via `ConsumerActions`.
    pub manual_ack: bool,
    /// Whether the broker should consider messages pre-acknowledged.
    pub no_ack: bool,
    /// Whether this consumer has exclusive access to the queue.
    pub exclusive: bool,
    /// Consumer priority (broker extension).
    pub priority: Option<i16>,
    /// Per-message handler processing timeout; defaults to 30s if unset.
    pub timeout: Option<Duration>,
    /// Extra consumer arguments passed through to the broker.
    pub arguments: BTreeMap<String, String>,
}

impl ConsumeOptions {
    /// The default per-message processing timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Resolves this option set's effective per-message timeout.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(Self::DEFAULT_TIMEOUT)
    }
}

/// Options accepted by `get`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Whether the broker should consider the message pre-acknowledged.
    pub no_ack: bool,
}

/// Broker extension arguments accepted by `assert_queue`.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Whether the queue survives broker restarts.
    pub durable: bool,
    /// Whether the queue is deleted once its last consumer disconnects.
    pub auto_delete: bool,
    /// Whether the queue is restricted to the declaring connection.
    pub exclusive: bool,
    /// The `x-dead-letter-exchange` extension argument.
    pub dead_letter_exchange: Option<String>,
    /// The `x-dead-letter-routing-key` extension argument.
    pub dead_letter_routing_key: Option<String>,
    /// The `x-message-ttl` extension argument, in milliseconds.
    pub message_ttl: Option<u32>,
    /// The `x-expires` extension argument, in milliseconds.
    pub expires: Option<u32>,
    /// The `x-max-length` extension argument.
    pub max_length: Option<u32>,
    /// The `x-max-priority` extension argument.
    pub max_priority: Option<u8>,
}

/// Broker extension arguments accepted by `assert_exchange`.
#[derive(Debug, Clone, Default)]
pub struct ExchangeOptions {
    /// Whether the exchange survives broker restarts.
    pub durable: bool,
    /// Whether the exchange is deleted once its last binding is removed.
    pub auto_delete: bool,
    /// The `alternate-exchange` extension argument.
    pub alternate_exchange: Option<String>,
}

/// Outcome of [`Client::assert_queue`](crate::Client::assert_queue) /
/// [`Client::check_queue`](crate::Client::check_queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueInfo {
    /// Number of messages currently ready for delivery.
    pub message_count: u32,
    /// Number of active consumers.
    pub consumer_count: u32,
}
