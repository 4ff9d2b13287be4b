mod lapin_driver;
#[cfg(test)]
pub(crate) mod mock;

pub use lapin_driver::LapinDriver;

use crate::error::CoreError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions, QueueUnbindOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};

/// An inbound delivery as handed across the driver seam, deliberately
/// decoupled from `lapin::message::Delivery` so that [`mock`] can produce
/// deliveries without a live connection.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// The outcome of a publish, once the broker has settled it (or immediately,
/// for a non-confirm channel).
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    Acked,
    Nacked,
    NotRequested,
    /// Positively confirmed but unroutable: the broker accepted the publish
    /// and is handing the message straight back via `basic.return`, because
    /// `mandatory` was set and no queue was bound to match it.
    Returned(Box<RawDelivery>),
}

/// Declared queue metadata, as reported by `queue_declare`/`queue_check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeclaredQueue {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// The low-level AMQP operations this crate's components depend on.
///
/// This is the seam the rest of the crate is built against instead of
/// `lapin` directly: the concrete `lapin::Connection`/`lapin::Channel`
/// dependency is pushed behind a trait object so [`mock::MockDriver`] can
/// stand in for it in tests without a broker. Implementations pass `lapin`'s
/// own wire types (`BasicProperties`, `FieldTable`) through unchanged, since
/// re-inventing mirrors of them would not make the framing any less
/// `lapin`'s concern.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Opens a new connection to the broker at `url`. `url` is expected to
    /// already be a fully resolved AMQP DSN (credentials included).
    async fn connect(&self, url: &str) -> Result<Box<dyn DriverConnection>, CoreError>;
}

/// A single open connection to a broker.
#[async_trait]
pub trait DriverConnection: Send + Sync {
    /// Opens a new channel on this connection, in publisher-confirm mode.
    async fn create_channel(&self) -> Result<Box<dyn DriverChannel>, CoreError>;

    /// Reports whether this connection is still believed open.
    fn is_connected(&self) -> bool;

    /// Reports whether the broker currently has this connection under
    /// flow-control back-pressure (a `connection.blocked` notification the
    /// broker has sent and not yet retracted). A synchronous status query,
    /// consistent with this seam's "no push callbacks" design — see
    /// `ConnectionSupervisor`'s connection-health background task, which
    /// polls this to detect block/unblock transitions.
    fn is_blocked(&self) -> bool;

    /// Initiates a graceful close of this connection.
    async fn close(&self) -> Result<(), CoreError>;
}

/// A single open channel on a [`DriverConnection`].
#[async_trait]
pub trait DriverChannel: Send + Sync {
    /// Reports whether this channel is still believed open.
    fn is_open(&self) -> bool;

    /// Initiates a graceful close of this channel.
    async fn close(&self) -> Result<(), CoreError>;

    /// Sets the consumer prefetch count for this channel, either per-consumer
    /// or per-channel (`global`).
    async fn set_prefetch(&self, count: u16, global: bool) -> Result<(), CoreError>;

    /// Publishes a single message, waiting for the broker's confirm (if the
    /// channel is in confirm mode).
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishOutcome, CoreError>;

    /// Starts a consumer on `queue`, returning a stream of deliveries.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<BoxStream<'static, Result<RawDelivery, CoreError>>, CoreError>;

    /// Fetches a single message from `queue` without starting a consumer.
    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<RawDelivery>, CoreError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), CoreError>;
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), CoreError>;
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), CoreError>;
    async fn cancel(&self, consumer_tag: &str) -> Result<(), CoreError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<DeclaredQueue, CoreError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), CoreError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueUnbindOptions,
        arguments: FieldTable,
    ) -> Result<(), CoreError>;

    async fn delete_queue(
        &self,
        name: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, CoreError>;

    async fn purge_queue(
        &self,
        name: &str,
        options: QueuePurgeOptions,
    ) -> Result<u32, CoreError>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), CoreError>;

    async fn delete_exchange(
        &self,
        name: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), CoreError>;
}
