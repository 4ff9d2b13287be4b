use crate::driver::DriverChannel;
use crate::error::{CoreError, ErrorCode};
use crate::events::{Event, EventBus};
use crate::message::{ConsumeOptions, Message};
use crate::metrics::Metrics;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// How a consumer settled a single message, for manual-ack mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

/// Handed to a `manualAck` consumer's handler. Guarantees at-most-one
/// settlement: the first of `ack`/`nack`/`reject` wins, and any later call is
/// ignored with a warning.
pub struct ConsumerActions {
    channel: Arc<dyn DriverChannel>,
    delivery_tag: u64,
    settled: AtomicBool,
}

impl ConsumerActions {
    fn new(channel: Arc<dyn DriverChannel>, delivery_tag: u64) -> Self {
        Self {
            channel,
            delivery_tag,
            settled: AtomicBool::new(false),
        }
    }

    /// Acknowledges the message. A no-op (with a warning) if already settled.
    pub async fn ack(&self) {
        self.settle(Settlement::Ack).await;
    }

    /// Negatively acknowledges the message, optionally requeueing it.
    pub async fn nack(&self, requeue: bool) {
        self.settle(Settlement::Nack { requeue }).await;
    }

    /// Rejects the message, optionally requeueing it.
    pub async fn reject(&self, requeue: bool) {
        self.settle(Settlement::Reject { requeue }).await;
    }

    async fn settle(&self, settlement: Settlement) {
        if self
            .settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(
                delivery_tag = self.delivery_tag,
                "Ignored a second settlement attempt for an already-settled message",
            );
            return;
        }

        let result = match settlement {
            Settlement::Ack => self.channel.ack(self.delivery_tag).await,
            Settlement::Nack { requeue } => self.channel.nack(self.delivery_tag, requeue).await,
            Settlement::Reject { requeue } => {
                self.channel.reject(self.delivery_tag, requeue).await
            }
        };

        if let Err(error) = result {
            warn!(
                delivery_tag = self.delivery_tag,
                ?error,
                error_message = %error,
                "Failed to settle a consumed message",
            );
        }
    }
}

/// The outcome of running one handler invocation, before settlement.
enum HandlerOutcome {
    Success,
    Failure(CoreError),
}

/// Runs a single delivery through the per-message processing flow: race the
/// handler against the configured timeout, then settle according to
/// `manual_ack`.
///
/// `handler` receives the inbound [`Message`] and, in manual-ack mode, a
/// [`ConsumerActions`] handle; in auto mode the second argument is `None`
/// and settlement is fully automatic.
pub(crate) async fn process_delivery<F, Fut>(
    channel: Arc<dyn DriverChannel>,
    message: Message,
    options: &ConsumeOptions,
    metrics: &Metrics,
    events: &EventBus,
    handler: F,
) where
    F: FnOnce(Message, Option<Arc<ConsumerActions>>) -> Fut,
    Fut: Future<Output = Result<(), CoreError>>,
{
    let delivery_tag = message.delivery_tag;
    let started = Instant::now();

    let actions = if options.manual_ack {
        Some(Arc::new(ConsumerActions::new(channel.clone(), delivery_tag)))
    } else {
        None
    };

    let handler_future = handler(message, actions.clone());

    let outcome = match tokio::time::timeout(options.effective_timeout(), handler_future).await {
        Ok(Ok(())) => HandlerOutcome::Success,
        Ok(Err(error)) => HandlerOutcome::Failure(error),
        Err(_) => HandlerOutcome::Failure(
            CoreError::new(ErrorCode::Consume, "handler did not complete within timeout")
                .with_detail("delivery_tag", delivery_tag.to_string()),
        ),
    };

    match outcome {
        HandlerOutcome::Success => {
            if !options.manual_ack && !options.no_ack {
                if let Err(error) = channel.ack(delivery_tag).await {
                    warn!(delivery_tag, ?error, error_message = %error, "Failed to ack message");
                }
            }

            let elapsed_millis = started.elapsed().as_secs_f64() * 1000.0;
            metrics.record_received(elapsed_millis);
        }
        HandlerOutcome::Failure(error) => {
            if !options.manual_ack && !options.no_ack {
                if let Err(nack_error) = channel.nack(delivery_tag, true).await {
                    warn!(
                        delivery_tag,
                        error = ?nack_error,
                        error_message = %nack_error,
                        "Failed to nack message after handler failure",
                    );
                }
            }

            metrics.record_error();
            events.emit(Event::Error(Arc::new(error)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::driver::Driver;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn sample_message(delivery_tag: u64) -> Message {
        Message {
            payload: b"payload".to_vec(),
            exchange: "orders".to_string(),
            routing_key: "orders.created".to_string(),
            delivery_tag,
            redelivered: false,
            content_type: None,
            correlation_id: None,
            message_id: None,
            reply_to: None,
            headers: BTreeMap::new(),
        }
    }

    async fn mock_channel() -> Arc<dyn DriverChannel> {
        let driver = MockDriver::new();
        let connection = driver.connect("amqp://node-a").await.unwrap();
        Arc::from(connection.create_channel().await.unwrap())
    }

    #[tokio::test]
    async fn auto_ack_success_updates_metrics_and_acks() {
        // Given
        let channel = mock_channel().await;
        let events = Arc::new(EventBus::new());
        let metrics = Metrics::new(events.clone());
        let options = ConsumeOptions::default();

        // When
        process_delivery(channel, sample_message(1), &options, &metrics, &events, |_msg, actions| {
            assert!(actions.is_none());
            async { Ok(()) }
        })
        .await;

        // Then
        assert_eq!(metrics.snapshot().messages_received, 1);
    }

    #[tokio::test]
    async fn auto_ack_failure_records_error_event() {
        // Given
        let channel = mock_channel().await;
        let events = Arc::new(EventBus::new());
        let metrics = Metrics::new(events.clone());
        let error_count = Arc::new(AtomicUsize::new(0));
        events.subscribe({
            let error_count = error_count.clone();
            move |event| {
                if matches!(event, Event::Error(_)) {
                    error_count.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        let options = ConsumeOptions::default();

        // When
        process_delivery(channel, sample_message(2), &options, &metrics, &events, |_msg, _actions| async {
            Err(CoreError::new(ErrorCode::Consume, "handler blew up"))
        })
        .await;

        // Then
        assert_eq!(metrics.snapshot().errors, 1);
        assert_eq!(error_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn handler_timeout_is_treated_as_failure() {
        // Given
        let channel = mock_channel().await;
        let events = Arc::new(EventBus::new());
        let metrics = Metrics::new(events.clone());
        let options = ConsumeOptions {
            timeout: Some(Duration::from_millis(10)),
            ..Default::default()
        };

        // When
        process_delivery(channel, sample_message(3), &options, &metrics, &events, |_msg, _actions| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
        .await;

        // Then
        assert_eq!(metrics.snapshot().errors, 1);
    }

    #[tokio::test]
    async fn manual_ack_second_settlement_is_ignored() {
        // Given
        let channel = mock_channel().await;
        let actions = Arc::new(ConsumerActions::new(channel, 4));

        // When
        actions.ack().await;
        actions.nack(true).await;

        // Then
        assert!(actions.settled.load(Ordering::SeqCst));
    }
}
