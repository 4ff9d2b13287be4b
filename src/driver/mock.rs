//! An in-memory stand-in for [`LapinDriver`](super::LapinDriver), used by
//! this crate's own unit tests so that channel-pool, breaker, consume, and
//! supervisor behavior can be exercised deterministically without a live
//! broker, swapping the concrete broker dependency for a hand-rolled double
//! so the default `cargo test` run needs no external service.

use super::{DeclaredQueue, Driver, DriverChannel, DriverConnection, PublishOutcome, RawDelivery};
use crate::error::{CoreError, ErrorCode};
use async_trait::async_trait;
use futures::stream::BoxStream;
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions, QueueUnbindOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A queue of canned outcomes for [`MockDriver::connect`], consumed in order.
/// Lets a test script a flaky connect sequence (e.g. fail twice, then
/// succeed) to exercise backoff/retry/breaker behavior.
#[derive(Default)]
pub(crate) struct MockDriver {
    connect_results: Mutex<VecDeque<bool>>,
    connect_attempts: AtomicUsize,
    published: Mutex<Vec<(String, String, Vec<u8>)>>,
    next_delivery_tag: AtomicU64,
    return_next_publish: Arc<AtomicBool>,
}

impl MockDriver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Scripts the outcome of the next `connect_count` calls to `connect`:
    /// `true` succeeds, `false` fails.
    pub(crate) fn script_connects(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.connect_results.lock().extend(outcomes);
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub(crate) fn published(&self) -> Vec<(String, String, Vec<u8>)> {
        self.published.lock().clone()
    }

    /// Makes the next publish on any channel created from this driver come
    /// back as [`PublishOutcome::Returned`] instead of `Acked`.
    pub(crate) fn return_next_publish(&self) {
        self.return_next_publish.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(&self, url: &str) -> Result<Box<dyn DriverConnection>, CoreError> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let outcome = self.connect_results.lock().pop_front().unwrap_or(true);

        if !outcome {
            return Err(CoreError::new(ErrorCode::Connection, "mock connect failure")
                .with_detail("url", url));
        }

        Ok(Box::new(MockConnection {
            connected: AtomicBool::new(true),
            blocked: AtomicBool::new(false),
            return_next_publish: self.return_next_publish.clone(),
        }))
    }
}

struct MockConnection {
    connected: AtomicBool,
    blocked: AtomicBool,
    return_next_publish: Arc<AtomicBool>,
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn create_channel(&self) -> Result<Box<dyn DriverChannel>, CoreError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(CoreError::new(ErrorCode::Connection, "mock connection is closed"));
        }

        Ok(Box::new(MockChannel {
            open: AtomicBool::new(true),
            next_delivery_tag: AtomicU64::new(1),
            return_next_publish: self.return_next_publish.clone(),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<(), CoreError> {
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }
}

/// An in-memory channel: publishes are recorded rather than sent anywhere,
/// and `consume` returns a stream fed only by messages a test pushes onto it
/// via [`MockChannel::push_delivery`]... deliberately not exposed here,
/// since no test in this crate yet drives a live delivery stream through the
/// mock; `get` and direct `ack`/`nack`/`reject` calls are enough to cover
/// the pool/consume unit tests this double exists for.
struct MockChannel {
    open: AtomicBool,
    next_delivery_tag: AtomicU64,
    return_next_publish: Arc<AtomicBool>,
}

#[async_trait]
impl DriverChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<(), CoreError> {
        self.open.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn set_prefetch(&self, _count: u16, _global: bool) -> Result<(), CoreError> {
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _mandatory: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishOutcome, CoreError> {
        if !self.is_open() {
            return Err(CoreError::new(ErrorCode::Channel, "mock channel is closed"));
        }

        if self.return_next_publish.swap(false, Ordering::Relaxed) {
            return Ok(PublishOutcome::Returned(Box::new(RawDelivery {
                delivery_tag: 0,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
                properties,
                data: payload.to_vec(),
            })));
        }

        Ok(PublishOutcome::Acked)
    }

    async fn consume(
        &self,
        _queue: &str,
        _consumer_tag: &str,
        _options: BasicConsumeOptions,
        _arguments: FieldTable,
    ) -> Result<BoxStream<'static, Result<RawDelivery, CoreError>>, CoreError> {
        let (_sender, receiver) = mpsc::unbounded::<Result<RawDelivery, CoreError>>();
        Ok(Box::pin(receiver))
    }

    async fn get(&self, _queue: &str, _no_ack: bool) -> Result<Option<RawDelivery>, CoreError> {
        Ok(None)
    }

    async fn ack(&self, _delivery_tag: u64) -> Result<(), CoreError> {
        Ok(())
    }

    async fn nack(&self, _delivery_tag: u64, _requeue: bool) -> Result<(), CoreError> {
        Ok(())
    }

    async fn reject(&self, _delivery_tag: u64, _requeue: bool) -> Result<(), CoreError> {
        Ok(())
    }

    async fn cancel(&self, _consumer_tag: &str) -> Result<(), CoreError> {
        Ok(())
    }

    async fn declare_queue(
        &self,
        _name: &str,
        _options: QueueDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<DeclaredQueue, CoreError> {
        let _ = &self.next_delivery_tag;
        Ok(DeclaredQueue::default())
    }

    async fn bind_queue(
        &self,
        _queue: &str,
        _exchange: &str,
        _routing_key: &str,
        _options: QueueBindOptions,
        _arguments: FieldTable,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    async fn unbind_queue(
        &self,
        _queue: &str,
        _exchange: &str,
        _routing_key: &str,
        _options: QueueUnbindOptions,
        _arguments: FieldTable,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    async fn delete_queue(&self, _name: &str, _options: QueueDeleteOptions) -> Result<u32, CoreError> {
        Ok(0)
    }

    async fn purge_queue(&self, _name: &str, _options: QueuePurgeOptions) -> Result<u32, CoreError> {
        Ok(0)
    }

    async fn declare_exchange(
        &self,
        _name: &str,
        _kind: ExchangeKind,
        _options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    async fn delete_exchange(
        &self,
        _name: &str,
        _options: ExchangeDeleteOptions,
    ) -> Result<(), CoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn scripted_connect_failures_then_success() {
        // Given
        let driver = MockDriver::new();
        driver.script_connects([false, false, true]);

        // When
        let first = driver.connect("amqp://node-a").await;
        let second = driver.connect("amqp://node-a").await;
        let third = driver.connect("amqp://node-a").await;

        // Then
        assert!(first.is_err());
        assert!(second.is_err());
        assert!(third.is_ok());
        assert_eq!(driver.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn closed_connection_refuses_new_channels() {
        // Given
        let driver = MockDriver::new();
        let connection = driver.connect("amqp://node-a").await.unwrap();

        // When
        connection.close().await.unwrap();
        let channel = connection.create_channel().await;

        // Then
        assert!(channel.is_err());
    }
}
