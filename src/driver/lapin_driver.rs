use super::{DeclaredQueue, Driver, DriverChannel, DriverConnection, PublishOutcome, RawDelivery};
use crate::error::{CoreError, ErrorCode};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
    ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    QueuePurgeOptions, QueueUnbindOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

fn wire_error(context: &str, error: lapin::Error) -> CoreError {
    CoreError::new(ErrorCode::Connection, format!("{context}: {error}")).with_source(error)
}

/// The production [`Driver`], backed by `lapin` over the current Tokio
/// runtime, wiring the executor/reactor pair `lapin::Connection::connect`
/// needs to drive I/O on the ambient runtime.
#[derive(Debug, Default)]
pub struct LapinDriver {
    connect_count: AtomicUsize,
}

impl LapinDriver {
    /// Creates a new driver. Stateless beyond a diagnostic connect counter.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Driver for LapinDriver {
    async fn connect(&self, url: &str) -> Result<Box<dyn DriverConnection>, CoreError> {
        self.connect_count.fetch_add(1, Ordering::Relaxed);

        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = Connection::connect(url, properties)
            .await
            .map_err(|error| wire_error("failed to establish AMQP connection", error))?;

        Ok(Box::new(LapinConnection { connection }))
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl DriverConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Box<dyn DriverChannel>, CoreError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|error| wire_error("failed to create AMQP channel", error))?;

        channel
            .confirm_select(lapin::options::ConfirmSelectOptions::default())
            .await
            .map_err(|error| wire_error("failed to enable publisher confirms", error))?;

        Ok(Box::new(LapinChannel { channel }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    fn is_blocked(&self) -> bool {
        self.connection.status().blocked()
    }

    async fn close(&self) -> Result<(), CoreError> {
        self.connection
            .close(0, "closed by client")
            .await
            .or_else(|error| match error {
                lapin::Error::InvalidConnectionState(_) => Ok(()),
                error => Err(wire_error("failed to close AMQP connection", error)),
            })
    }
}

struct LapinChannel {
    channel: Channel,
}

fn raw_delivery(delivery: lapin::message::Delivery) -> RawDelivery {
    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: delivery.properties.clone(),
        data: delivery.data,
    }
}

#[async_trait]
impl DriverChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), CoreError> {
        self.channel
            .close(0, "closed by client")
            .await
            .or_else(|error| match error {
                lapin::Error::InvalidChannelState(_) => Ok(()),
                error => Err(wire_error("failed to close AMQP channel", error)),
            })
    }

    async fn set_prefetch(&self, count: u16, global: bool) -> Result<(), CoreError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global })
            .await
            .map_err(|error| wire_error("failed to set prefetch", error))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishOutcome, CoreError> {
        let options = BasicPublishOptions {
            mandatory,
            immediate: false,
        };

        let confirm = self
            .channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
            .map_err(|error| wire_error("failed to publish message", error))?
            .await
            .map_err(|error| wire_error("failed to await publisher confirm", error))?;

        Ok(match confirm {
            Confirmation::Ack(None) => PublishOutcome::Acked,
            Confirmation::Ack(Some(returned)) => {
                warn!(
                    exchange,
                    routing_key,
                    reply_code = returned.reply_code,
                    reply_text = %returned.reply_text,
                    "Mandatory publish was confirmed but returned as unroutable",
                );
                PublishOutcome::Returned(Box::new(RawDelivery {
                    delivery_tag: 0,
                    exchange: returned.exchange.to_string(),
                    routing_key: returned.routing_key.to_string(),
                    redelivered: false,
                    properties: returned.properties,
                    data: returned.data,
                }))
            }
            Confirmation::Nack(_) => PublishOutcome::Nacked,
            Confirmation::NotRequested => PublishOutcome::NotRequested,
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<BoxStream<'static, Result<RawDelivery, CoreError>>, CoreError> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, arguments)
            .await
            .map_err(|error| wire_error("failed to start consumer", error))?;

        let stream = consumer.map(|result| {
            result
                .map(|delivery| raw_delivery(delivery))
                .map_err(|error| wire_error("consumer stream error", error))
        });

        Ok(Box::pin(stream))
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<RawDelivery>, CoreError> {
        let options = lapin::options::BasicGetOptions { no_ack };

        let message = self
            .channel
            .basic_get(queue, options)
            .await
            .map_err(|error| wire_error("failed to get message", error))?;

        Ok(message.map(|message| raw_delivery(message.delivery)))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), CoreError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|error| wire_error("failed to ack message", error))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), CoreError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple: false, requeue })
            .await
            .map_err(|error| wire_error("failed to nack message", error))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), CoreError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|error| wire_error("failed to reject message", error))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), CoreError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|error| wire_error("failed to cancel consumer", error))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<DeclaredQueue, CoreError> {
        let queue = self
            .channel
            .queue_declare(name, options, arguments)
            .await
            .map_err(|error| wire_error("failed to declare queue", error))?;

        Ok(DeclaredQueue {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), CoreError> {
        self.channel
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await
            .map_err(|error| wire_error("failed to bind queue", error))
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueUnbindOptions,
        arguments: FieldTable,
    ) -> Result<(), CoreError> {
        let _ = options;

        self.channel
            .queue_unbind(queue, exchange, routing_key, arguments)
            .await
            .map_err(|error| wire_error("failed to unbind queue", error))
    }

    async fn delete_queue(&self, name: &str, options: QueueDeleteOptions) -> Result<u32, CoreError> {
        self.channel
            .queue_delete(name, options)
            .await
            .map_err(|error| wire_error("failed to delete queue", error))
    }

    async fn purge_queue(&self, name: &str, options: QueuePurgeOptions) -> Result<u32, CoreError> {
        self.channel
            .queue_purge(name, options)
            .await
            .map_err(|error| wire_error("failed to purge queue", error))
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), CoreError> {
        self.channel
            .exchange_declare(name, kind, options, arguments)
            .await
            .map_err(|error| wire_error("failed to declare exchange", error))
    }

    async fn delete_exchange(
        &self,
        name: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), CoreError> {
        self.channel
            .exchange_delete(name, options)
            .await
            .map_err(|error| wire_error("failed to delete exchange", error))
    }
}
