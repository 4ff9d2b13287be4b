use crate::config::Config;
use crate::consume::process_delivery;
use crate::driver::{Driver, DriverChannel, LapinDriver};
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::events::{Event, EventBus, SubscriptionId};
use crate::message::{
    BatchMessage, ConsumeOptions, ExchangeOptions, GetOptions, Message, PublishOptions,
    QueueInfo, QueueOptions,
};
use crate::metrics::MetricsSnapshot;
use crate::supervisor::ConnectionSupervisor;
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions, QueueUnbindOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, ExchangeKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Renders a field-table value back to a string, for the headers a consumer
/// sees on [`Message`]. Exact for the string variants this crate itself ever
/// writes via [`basic_properties`]; anything else falls back to its debug
/// form rather than failing.
fn amqp_value_to_string(value: &AMQPValue) -> String {
    match value {
        AMQPValue::ShortString(value) => value.as_str().to_string(),
        AMQPValue::LongString(value) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
        other => format!("{other:?}"),
    }
}

/// The resilient, reconnecting AMQP client.
///
/// A thin public facade over a [`ConnectionSupervisor`]: every operation here
/// resolves the default channel (or leases a pooled one), delegates to the
/// driver, and folds the outcome into metrics/events through
/// [`Client::handle_error`].
#[derive(Clone)]
pub struct Client {
    supervisor: Arc<ConnectionSupervisor>,
}

impl Client {
    /// Validates `config`, connects using the production `lapin`-backed
    /// driver, and starts every background task.
    pub async fn connect(config: Config) -> CoreResult<Self> {
        Self::connect_with_driver(config, Arc::new(LapinDriver::new())).await
    }

    /// Same as [`connect`](Self::connect), but against a caller-supplied
    /// [`Driver`] — the seam [`crate::driver::mock::MockDriver`] (test-only)
    /// and any custom production driver use.
    pub async fn connect_with_driver(config: Config, driver: Arc<dyn Driver>) -> CoreResult<Self> {
        config.validate()?;

        let supervisor = ConnectionSupervisor::new(config, driver);
        supervisor.connect().await?;
        supervisor.spawn_background_tasks();

        Ok(Self { supervisor })
    }

    /// Routes an error through metrics and the event bus, then returns it
    /// unchanged so the caller can propagate it with `?`. In addition to the
    /// generic [`Event::Error`], connection- and channel-scoped codes also
    /// raise their dedicated [`Event::ConnectionError`]/[`Event::ChannelError`]
    /// so observers can subscribe narrowly without filtering the catch-all.
    fn handle_error(&self, error: CoreError) -> CoreError {
        self.supervisor.metrics.record_error();

        let copy = Arc::new(error.to_event_copy());

        match error.code() {
            ErrorCode::Connection | ErrorCode::ConnectionTimeout | ErrorCode::Reconnection | ErrorCode::Cluster => {
                self.supervisor.events.emit(Event::ConnectionError(copy.clone()));
            }
            ErrorCode::Channel | ErrorCode::ChannelAcquisitionTimeout => {
                self.supervisor.events.emit(Event::ChannelError(copy.clone()));
            }
            _ => {}
        }

        self.supervisor.events.emit(Event::Error(copy));
        error
    }

    async fn default_channel(&self) -> CoreResult<Arc<dyn DriverChannel>> {
        self.supervisor.default_channel().await
    }

    /// Leases a confirm-capable channel from the pool.
    /// Distinct from the default channel used by every other operation on
    /// this client; callers that want to pipeline independent work across
    /// several channels acquire them explicitly here and release them when
    /// done via [`release_channel`](Self::release_channel).
    pub async fn acquire_channel(&self) -> CoreResult<crate::pool::LeasedChannel> {
        self.supervisor
            .acquire_pooled_channel()
            .await
            .map_err(|e| self.handle_error(e))
    }

    /// Returns a channel leased via [`acquire_channel`](Self::acquire_channel)
    /// to the pool's free set. Idempotent: releasing an already-released or
    /// since-evicted channel is a no-op.
    pub async fn release_channel(&self, leased: crate::pool::LeasedChannel) {
        self.supervisor.release_pooled_channel(leased).await;
    }
}

// ---------------------------------------------------------------------
// Publish path
// ---------------------------------------------------------------------

impl Client {
    /// Publishes a single message, waiting for the broker's confirm.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> CoreResult<()> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;

        let properties = basic_properties(options);
        let publish_future = channel.publish(exchange, routing_key, options.mandatory, payload, properties);

        let outcome = match tokio::time::timeout(options.effective_timeout(), publish_future).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(error)) => return Err(self.handle_error(error)),
            Err(_) => {
                let error = CoreError::new(ErrorCode::PublishTimeout, "publish confirm timed out")
                    .with_detail("exchange", exchange)
                    .with_detail("routing_key", routing_key);
                return Err(self.handle_error(error));
            }
        };

        match outcome {
            crate::driver::PublishOutcome::Nacked => {
                let error = CoreError::new(ErrorCode::Publish, "broker nacked the published message")
                    .with_detail("exchange", exchange)
                    .with_detail("routing_key", routing_key);
                Err(self.handle_error(error))
            }
            crate::driver::PublishOutcome::Returned(raw) => {
                self.supervisor
                    .events
                    .emit(Event::MessageReturned(Box::new(to_message(*raw))));

                let error = CoreError::new(ErrorCode::Publish, "broker returned an unroutable mandatory publish")
                    .with_detail("exchange", exchange)
                    .with_detail("routing_key", routing_key);
                Err(self.handle_error(error))
            }
            crate::driver::PublishOutcome::Acked | crate::driver::PublishOutcome::NotRequested => {
                self.supervisor.metrics.record_sent();
                Ok(())
            }
        }
    }

    /// Publishes every message in order, awaiting each individual confirm
    /// before starting the next. Stops and surfaces the first failure; no
    /// cross-message transactional guarantee is made.
    pub async fn publish_batch(&self, messages: &[BatchMessage]) -> CoreResult<()> {
        for message in messages {
            self.publish(&message.exchange, &message.routing_key, &message.payload, &message.options)
                .await?;
        }

        Ok(())
    }

    /// Publishes to the default exchange, using `queue` as the routing key.
    pub async fn send_to_queue(&self, queue: &str, payload: &[u8], options: &PublishOptions) -> CoreResult<()> {
        self.publish("", queue, payload, options).await
    }
}

fn basic_properties(options: &PublishOptions) -> BasicProperties {
    let mut properties = BasicProperties::default();

    if options.persistent {
        properties = properties.with_delivery_mode(2);
    }

    if let Some(content_type) = &options.content_type {
        properties = properties.with_content_type(content_type.as_str().into());
    }

    if let Some(correlation_id) = &options.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }

    if let Some(message_id) = &options.message_id {
        properties = properties.with_message_id(message_id.as_str().into());
    }

    if let Some(reply_to) = &options.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }

    if let Some(expiration) = &options.expiration {
        properties = properties.with_expiration(expiration.as_str().into());
    }

    if !options.headers.is_empty() {
        let mut table = FieldTable::default();

        for (key, value) in &options.headers {
            table.insert(key.as_str().into(), AMQPValue::LongString(value.as_bytes().into()));
        }

        properties = properties.with_headers(table);
    }

    properties
}

fn to_message(raw: crate::driver::RawDelivery) -> Message {
    let properties = &raw.properties;

    let mut headers = BTreeMap::new();

    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            headers.insert(key.as_str().to_string(), amqp_value_to_string(value));
        }
    }

    Message {
        payload: raw.data,
        exchange: raw.exchange,
        routing_key: raw.routing_key,
        delivery_tag: raw.delivery_tag,
        redelivered: raw.redelivered,
        content_type: properties.content_type().as_ref().map(|v| v.as_str().to_string()),
        correlation_id: properties.correlation_id().as_ref().map(|v| v.as_str().to_string()),
        message_id: properties.message_id().as_ref().map(|v| v.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|v| v.as_str().to_string()),
        headers,
    }
}

// ---------------------------------------------------------------------
// Consume path
// ---------------------------------------------------------------------

impl Client {
    /// Registers a consumer on the default channel and returns its tag.
    /// `handler` is invoked once per delivery; a new invocation is spawned for
    /// every delivery so that one slow handler does not block the rest of the
    /// stream.
    pub async fn consume<F, Fut>(
        &self,
        queue: &str,
        options: ConsumeOptions,
        handler: F,
    ) -> CoreResult<String>
    where
        F: Fn(Message, Option<Arc<crate::consume::ConsumerActions>>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = CoreResult<()>> + Send + 'static,
    {
        use futures::StreamExt;

        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;
        let consumer_tag = self.supervisor.next_consumer_tag();

        let consume_options = BasicConsumeOptions {
            no_local: false,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            nowait: false,
        };

        let mut arguments = FieldTable::default();

        for (key, value) in &options.arguments {
            arguments.insert(key.as_str().into(), AMQPValue::LongString(value.as_bytes().into()));
        }

        if let Some(priority) = options.priority {
            arguments.insert("x-priority".into(), AMQPValue::ShortInt(priority));
        }

        let mut stream = channel
            .consume(queue, &consumer_tag, consume_options, arguments)
            .await
            .map_err(|e| self.handle_error(e))?;

        let handler = Arc::new(handler);
        let metrics = self.supervisor.metrics.clone();
        let events = self.supervisor.events.clone();
        let gate = self.supervisor.shutdown.gate();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = gate.opened() => break,
                    next = stream.next() => {
                        let Some(delivery) = next else { break };

                        let delivery = match delivery {
                            Ok(delivery) => delivery,
                            Err(error) => {
                                warn!(?error, error_message = %error, "Consumer stream reported an error");
                                metrics.record_error();
                                events.emit(Event::Error(Arc::new(error.to_event_copy())));
                                continue;
                            }
                        };

                        let message = to_message(delivery);
                        let channel = channel.clone();
                        let options = options.clone();
                        let metrics = metrics.clone();
                        let events = events.clone();
                        let handler = handler.clone();

                        tokio::spawn(async move {
                            process_delivery(channel, message, &options, &metrics, &events, move |msg, actions| {
                                (*handler)(msg, actions)
                            })
                            .await;
                        });
                    }
                }
            }
        });

        Ok(consumer_tag)
    }

    /// Cancels a previously registered consumer.
    pub async fn cancel(&self, consumer_tag: &str) -> CoreResult<()> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;
        channel.cancel(consumer_tag).await.map_err(|e| self.handle_error(e))
    }

    /// Sets the consumer prefetch count on the default channel.
    pub async fn prefetch(&self, count: u16, global: bool) -> CoreResult<()> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;
        channel
            .set_prefetch(count, global)
            .await
            .map_err(|e| self.handle_error(e))
    }

    /// Performs a synchronous pull from `queue`. Returns `None` if the queue
    /// is currently empty.
    pub async fn get(&self, queue: &str, options: &GetOptions) -> CoreResult<Option<Message>> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;

        let raw = channel
            .get(queue, options.no_ack)
            .await
            .map_err(|e| self.handle_error(e))?;

        match raw {
            Some(raw) => {
                self.supervisor.metrics.record_received(0.0);
                Ok(Some(to_message(raw)))
            }
            None => Ok(None),
        }
    }

    /// Acknowledges a message fetched via [`get`](Self::get), by delivery tag.
    pub async fn ack(&self, delivery_tag: u64) -> CoreResult<()> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;
        channel.ack(delivery_tag).await.map_err(|e| self.handle_error(e))
    }

    /// Negatively acknowledges a message fetched via [`get`](Self::get).
    pub async fn nack(&self, delivery_tag: u64, requeue: bool) -> CoreResult<()> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;
        channel
            .nack(delivery_tag, requeue)
            .await
            .map_err(|e| self.handle_error(e))
    }

    /// Rejects a message fetched via [`get`](Self::get).
    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> CoreResult<()> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;
        channel
            .reject(delivery_tag, requeue)
            .await
            .map_err(|e| self.handle_error(e))
    }
}

// ---------------------------------------------------------------------
// Topology operations
// ---------------------------------------------------------------------

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut table = FieldTable::default();

    if let Some(exchange) = &options.dead_letter_exchange {
        table.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(exchange.as_bytes().into()));
    }

    if let Some(routing_key) = &options.dead_letter_routing_key {
        table.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.as_bytes().into()),
        );
    }

    if let Some(ttl) = options.message_ttl {
        table.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl));
    }

    if let Some(expires) = options.expires {
        table.insert("x-expires".into(), AMQPValue::LongUInt(expires));
    }

    if let Some(max_length) = options.max_length {
        table.insert("x-max-length".into(), AMQPValue::LongUInt(max_length));
    }

    if let Some(max_priority) = options.max_priority {
        table.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(max_priority));
    }

    table
}

fn exchange_arguments(options: &ExchangeOptions) -> FieldTable {
    let mut table = FieldTable::default();

    if let Some(alternate) = &options.alternate_exchange {
        table.insert("alternate-exchange".into(), AMQPValue::LongString(alternate.as_bytes().into()));
    }

    table
}

impl Client {
    /// Declares (or confirms) a queue.
    pub async fn assert_queue(&self, name: &str, options: &QueueOptions) -> CoreResult<QueueInfo> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;

        let declare_options = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: false,
        };

        let declared = channel
            .declare_queue(name, declare_options, queue_arguments(options))
            .await
            .map_err(|e| self.handle_error(e.with_detail("queue", name)))?;

        Ok(QueueInfo {
            message_count: declared.message_count,
            consumer_count: declared.consumer_count,
        })
    }

    /// Checks an existing queue's metadata without declaring it (a passive
    /// declare).
    pub async fn check_queue(&self, name: &str) -> CoreResult<QueueInfo> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;

        let declare_options = QueueDeclareOptions {
            passive: true,
            ..Default::default()
        };

        let declared = channel
            .declare_queue(name, declare_options, FieldTable::default())
            .await
            .map_err(|e| self.handle_error(e.with_detail("queue", name)))?;

        Ok(QueueInfo {
            message_count: declared.message_count,
            consumer_count: declared.consumer_count,
        })
    }

    /// Declares (or confirms) an exchange of the given kind.
    pub async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> CoreResult<()> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;

        let declare_options = ExchangeDeclareOptions {
            passive: false,
            durable: options.durable,
            auto_delete: options.auto_delete,
            internal: false,
            nowait: false,
        };

        channel
            .declare_exchange(name, kind, declare_options, exchange_arguments(options))
            .await
            .map_err(|e| self.handle_error(e.with_detail("exchange", name)))
    }

    /// Binds `queue` to `exchange` under `routing_key`.
    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> CoreResult<()> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;

        channel
            .bind_queue(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| self.handle_error(e.with_detail("queue", queue).with_detail("exchange", exchange)))
    }

    /// Removes a binding between `queue` and `exchange` under `routing_key`.
    pub async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> CoreResult<()> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;

        channel
            .unbind_queue(
                queue,
                exchange,
                routing_key,
                QueueUnbindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.handle_error(e.with_detail("queue", queue).with_detail("exchange", exchange)))
    }

    /// Deletes a queue, returning the number of messages it held.
    pub async fn delete_queue(&self, name: &str) -> CoreResult<u32> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;

        channel
            .delete_queue(name, QueueDeleteOptions::default())
            .await
            .map_err(|e| self.handle_error(e.with_detail("queue", name)))
    }

    /// Purges a queue, returning the number of messages removed.
    pub async fn purge_queue(&self, name: &str) -> CoreResult<u32> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;

        channel
            .purge_queue(name, QueuePurgeOptions::default())
            .await
            .map_err(|e| self.handle_error(e.with_detail("queue", name)))
    }

    /// Deletes an exchange.
    pub async fn delete_exchange(&self, name: &str) -> CoreResult<()> {
        let channel = self.default_channel().await.map_err(|e| self.handle_error(e))?;

        channel
            .delete_exchange(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|e| self.handle_error(e.with_detail("exchange", name)))
    }
}

// ---------------------------------------------------------------------
// Lifecycle, observability
// ---------------------------------------------------------------------

impl Client {
    /// Performs a lightweight broker probe.
    /// Never fails; any underlying error simply yields `false`.
    pub async fn health_check(&self) -> bool {
        self.supervisor.health_check().await
    }

    /// Returns a point-in-time snapshot of this client's metrics.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.supervisor.metrics.snapshot()
    }

    /// Subscribes to this client's event bus.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.supervisor.events.subscribe(handler)
    }

    /// Removes a previously registered event subscriber.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.supervisor.events.unsubscribe(id);
    }

    /// Stops background tasks and closes every channel and the connection,
    /// ignoring individual close errors. Safe to call more than once.
    pub async fn close(&self) -> CoreResult<()> {
        self.supervisor.close().await
    }

    /// Same as [`close`](Self::close), but first blocks reconnect and drains
    /// in-flight messages (up to a 3 s cap) before closing.
    pub async fn graceful_shutdown(&self) -> CoreResult<()> {
        self.supervisor.graceful_shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use pretty_assertions::assert_eq;

    fn test_config() -> Config {
        Config::default().with_url("amqp://node-a")
    }

    #[tokio::test]
    async fn connect_fails_fast_when_every_node_is_unreachable() {
        // Given
        let driver = Arc::new(MockDriver::new());
        driver.script_connects([false, false, false, false, false]);

        // When
        let result = Client::connect_with_driver(test_config(), driver).await;

        // Then
        assert_eq!(result.unwrap_err().code(), ErrorCode::Cluster);
    }

    #[tokio::test]
    async fn publish_succeeds_against_mock_driver_and_increments_metrics() {
        // Given
        let driver = Arc::new(MockDriver::new());
        let client = Client::connect_with_driver(test_config(), driver).await.unwrap();

        // When
        client
            .publish("orders", "orders.created", b"payload", &PublishOptions::default())
            .await
            .unwrap();

        // Then
        assert_eq!(client.get_metrics().messages_sent, 1);
    }

    #[tokio::test]
    async fn returned_mandatory_publish_is_a_failure_and_emits_message_returned() {
        // Given
        let driver = Arc::new(MockDriver::new());
        driver.return_next_publish();
        let client = Client::connect_with_driver(test_config(), driver).await.unwrap();

        let returned = Arc::new(std::sync::Mutex::new(None));
        client.subscribe({
            let returned = returned.clone();
            move |event| {
                if let Event::MessageReturned(message) = event {
                    *returned.lock().unwrap() = Some((**message).clone());
                }
            }
        });

        // When
        let result = client
            .publish(
                "orders",
                "orders.created",
                b"payload",
                &PublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
            )
            .await;

        // Then
        assert_eq!(result.unwrap_err().code(), ErrorCode::Publish);
        assert_eq!(client.get_metrics().messages_sent, 0);
        assert_eq!(returned.lock().unwrap().as_ref().unwrap().payload, b"payload");
    }

    #[tokio::test]
    async fn assert_queue_round_trips_through_mock_driver() {
        // Given
        let driver = Arc::new(MockDriver::new());
        let client = Client::connect_with_driver(test_config(), driver).await.unwrap();

        // When
        let info = client.assert_queue("orders", &QueueOptions::default()).await.unwrap();

        // Then
        assert_eq!(info, QueueInfo::default());
    }

    #[tokio::test]
    async fn pooled_channels_are_leased_independently_of_the_default_channel() {
        // Given
        let driver = Arc::new(MockDriver::new());
        let client = Client::connect_with_driver(test_config(), driver).await.unwrap();

        // When
        let leased = client.acquire_channel().await.unwrap();

        // Then
        assert!(leased.channel().is_open());
        client.release_channel(leased).await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        // Given
        let driver = Arc::new(MockDriver::new());
        let client = Client::connect_with_driver(test_config(), driver).await.unwrap();

        // When
        let started = Instant::now();
        client.close().await.unwrap();
        client.close().await.unwrap();

        // Then
        assert!(started.elapsed().as_secs() < 5);
    }
}
