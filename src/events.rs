use crate::error::CoreError;
use crate::message::Message;
use crate::metrics::MetricsSnapshot;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// The full set of lifecycle events a [`Client`](crate::Client) may emit.
///
/// A single tagged-union `Event` enum rather than per-kind callback types —
/// the natural Rust shape for a closed set of event kinds.
#[derive(Debug, Clone)]
pub enum Event {
    /// Start of any connect attempt.
    Connecting,
    /// Successful connect.
    Connected,
    /// Driver-reported connection error.
    ConnectionError(Arc<CoreError>),
    /// Driver-reported connection close.
    ConnectionClosed,
    /// All connect retries exhausted.
    ConnectionFailed(Arc<CoreError>),
    /// Driver-reported channel error.
    ChannelError(Arc<CoreError>),
    /// Channel closed.
    ChannelClosed,
    /// Channel write buffer drained.
    ChannelDrain,
    /// Broker returned an unroutable mandatory publish.
    MessageReturned(Box<Message>),
    /// Periodic or counter-triggered metrics emission.
    Metrics(MetricsSnapshot),
    /// Start of a reconnect cycle.
    Reconnecting,
    /// Reconnect succeeded.
    Reconnected,
    /// Reconnect retries exhausted.
    ReconnectFailed(Arc<CoreError>),
    /// Broker flow-control applied, with the broker-supplied reason.
    Blocked(String),
    /// Broker flow-control cleared.
    Unblocked,
    /// Any error routed through the central error handler.
    Error(Arc<CoreError>),
    /// The client has fully shut down.
    Closed,
}

impl Event {
    /// A short, stable name for this event's variant, useful for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ConnectionError(_) => "connectionError",
            Self::ConnectionClosed => "connectionClosed",
            Self::ConnectionFailed(_) => "connectionFailed",
            Self::ChannelError(_) => "channelError",
            Self::ChannelClosed => "channelClosed",
            Self::ChannelDrain => "channelDrain",
            Self::MessageReturned(_) => "messageReturned",
            Self::Metrics(_) => "metrics",
            Self::Reconnecting => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::ReconnectFailed(_) => "reconnectFailed",
            Self::Blocked(_) => "blocked",
            Self::Unblocked => "unblocked",
            Self::Error(_) => "error",
            Self::Closed => "closed",
        }
    }
}

/// Opaque handle returned by [`EventBus::subscribe`], usable to
/// [`unsubscribe`](EventBus::unsubscribe) later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: Box<dyn Fn(&Event) + Send + Sync>,
}

/// An ordered, multi-subscriber, synchronous event channel.
///
/// Subscribers are invoked in registration order. A panicking subscriber is
/// caught, logged, and does not prevent later subscribers from running.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates a new, empty event bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler to be called, in order, for every subsequent
    /// [`emit`](Self::emit). Returns a handle usable to
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.subscriptions.lock().push(Subscription {
            id,
            handler: Box::new(handler),
        });

        id
    }

    /// Removes a previously registered subscriber. A no-op if the id is
    /// unknown (e.g., already unsubscribed).
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.lock().retain(|s| s.id != id);
    }

    /// Synchronously calls every registered subscriber, in registration
    /// order, with the given event. A subscriber that panics is caught and
    /// logged; later subscribers still run.
    ///
    /// Note: subscribers must not call [`subscribe`](Self::subscribe) or
    /// [`unsubscribe`](Self::unsubscribe) on this same bus, as that would
    /// attempt to re-enter the lock held for the duration of this call.
    pub fn emit(&self, event: Event) {
        let subscriptions = self.subscriptions.lock();

        for subscription in subscriptions.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| (subscription.handler)(&event)));

            if result.is_err() {
                error!(
                    event = event.name(),
                    "An event subscriber panicked; continuing with remaining subscribers",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscribers_are_called_in_registration_order() {
        // Given
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe({
            let order = order.clone();
            move |_| order.lock().push(1)
        });
        bus.subscribe({
            let order = order.clone();
            move |_| order.lock().push(2)
        });

        // When
        bus.emit(Event::Connected);

        // Then
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn panicking_subscriber_does_not_block_later_ones() {
        // Given
        let bus = EventBus::new();
        let called = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| panic!("boom"));
        bus.subscribe({
            let called = called.clone();
            move |_| {
                called.fetch_add(1, Ordering::Relaxed);
            }
        });

        // When
        bus.emit(Event::Connected);

        // Then
        assert_eq!(called.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unsubscribe_stops_future_delivery() {
        // Given
        let bus = EventBus::new();
        let called = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe({
            let called = called.clone();
            move |_| {
                called.fetch_add(1, Ordering::Relaxed);
            }
        });

        // When
        bus.unsubscribe(id);
        bus.emit(Event::Connected);

        // Then
        assert_eq!(called.load(Ordering::Relaxed), 0);
    }
}
