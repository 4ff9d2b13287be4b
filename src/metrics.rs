use crate::events::{Event, EventBus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A point-in-time copy of a [`Metrics`] counter set, the kind of value
/// handed to subscribers on the `metrics` event and returned by
/// `Client::get_metrics`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    /// Total messages successfully published and confirmed.
    pub messages_sent: u64,
    /// Total messages successfully delivered to a consumer handler.
    pub messages_received: u64,
    /// Total errors routed through the central error handler.
    pub errors: u64,
    /// Total completed reconnect cycles.
    pub reconnections: u64,
    /// Unix-epoch millis of the last successful reconnect, if any.
    pub last_reconnect_time: Option<u64>,
    /// Running average processing time (millis) across consumed messages.
    pub avg_processing_time: f64,
}

/// The live, mutable counter set owned exclusively by a [`Client`](crate::Client).
///
/// All counters are monotonically non-decreasing for the life of a client.
/// `avg_processing_time` is the one non-monotonic field, updated as
/// `(prev + elapsed) / 2` on every settled delivery. Every counter mutation
/// also emits an [`Event::Metrics`] snapshot on `events`, in addition to the
/// periodic emission `ConnectionSupervisor` drives separately.
pub struct Metrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    errors: AtomicU64,
    reconnections: AtomicU64,
    last_reconnect_time: AtomicU64,
    // Stored as bits of an f64 behind an atomic, since there is no AtomicF64.
    avg_processing_time_bits: AtomicU64,
    events: Arc<EventBus>,
}

impl Metrics {
    /// Creates a fresh, zeroed counter set that emits onto `events`.
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            last_reconnect_time: AtomicU64::new(0),
            avg_processing_time_bits: AtomicU64::new(0),
            events,
        }
    }

    fn emit_snapshot(&self) {
        self.events.emit(Event::Metrics(self.snapshot()));
    }

    /// Increments the sent-message counter by one.
    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.emit_snapshot();
    }

    /// Increments the sent-message counter by the given amount.
    pub fn record_sent_many(&self, count: u64) {
        self.messages_sent.fetch_add(count, Ordering::Relaxed);
        self.emit_snapshot();
    }

    /// Increments the received-message counter by one and folds the given
    /// processing duration into the running average.
    pub fn record_received(&self, processing_millis: f64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);

        loop {
            let current_bits = self.avg_processing_time_bits.load(Ordering::Relaxed);
            let current = f64::from_bits(current_bits);
            let updated = (current + processing_millis) / 2.0;
            let updated_bits = updated.to_bits();

            if self
                .avg_processing_time_bits
                .compare_exchange_weak(
                    current_bits,
                    updated_bits,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }

        self.emit_snapshot();
    }

    /// Increments the error counter by one.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.emit_snapshot();
    }

    /// Increments the reconnection counter by one and stamps the current
    /// time as the last reconnect time.
    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);

        let now_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        self.last_reconnect_time.store(now_millis, Ordering::Relaxed);
        self.emit_snapshot();
    }

    /// Returns a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_reconnect_time = match self.last_reconnect_time.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(millis),
        };

        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            last_reconnect_time,
            avg_processing_time: f64::from_bits(
                self.avg_processing_time_bits.load(Ordering::Relaxed),
            ),
        }
    }
}
