use crate::backoff::{Backoff, BackoffPolicy};
use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::driver::{Driver, DriverChannel, DriverConnection};
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::events::{Event, EventBus};
use crate::metrics::Metrics;
use crate::pool::ChannelPool;
use crate::redact::redact_url;
use crate::registry::NodeRegistry;
use crate::sync::Latch;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// The maximum number of distinct broker URLs a single `connect()` cycle will
/// try.
const MAX_URL_ATTEMPTS: usize = 5;

/// The name of the transient queue used by [`ConnectionSupervisor::health_check`].
const HEALTH_CHECK_QUEUE: &str = "healthCheckQueue";

#[derive(Default)]
struct State {
    connection: Option<Arc<dyn DriverConnection>>,
    default_channel: Option<Arc<dyn DriverChannel>>,
}

/// Owns the single active connection, the default channel, and every
/// background task that keeps them alive.
///
/// Generalizes a single-DSN connector into a cluster-aware one backed by a
/// [`NodeRegistry`]/[`CircuitBreaker`] pair.
pub struct ConnectionSupervisor {
    pub(crate) config: Config,
    driver: Arc<dyn Driver>,
    pub(crate) registry: NodeRegistry,
    breaker: CircuitBreaker,
    pub(crate) pool: ChannelPool,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) events: Arc<EventBus>,
    backoff: Backoff,
    pub(crate) shutdown: Latch,
    state: AsyncMutex<State>,
    op_lock: AsyncMutex<()>,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    next_consumer_id: AtomicU64,
    blocked: AtomicBool,
}

impl ConnectionSupervisor {
    /// Assembles a new, not-yet-connected supervisor around the given driver
    /// and validated configuration.
    pub(crate) fn new(config: Config, driver: Arc<dyn Driver>) -> Arc<Self> {
        let registry = NodeRegistry::new(
            config.urls.clone(),
            config.cluster.priority_nodes.clone(),
            config.failover_strategy,
            config.cluster.shuffle_nodes,
        );
        let breaker = CircuitBreaker::new(config.breaker.failure_threshold, config.breaker.reset_timeout);
        let pool = ChannelPool::new(config.pool.max_channels, config.pool.acquire_timeout);
        let backoff = Backoff::new(BackoffPolicy::new(
            config.reconnect_delay(),
            Duration::from_secs(60),
            config.exponential_backoff,
        ));
        let events = Arc::new(EventBus::new());

        Arc::new(Self {
            config,
            driver,
            registry,
            breaker,
            pool,
            metrics: Arc::new(Metrics::new(events.clone())),
            events,
            backoff,
            shutdown: Latch::new(),
            state: AsyncMutex::new(State::default()),
            op_lock: AsyncMutex::new(()),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_consumer_id: AtomicU64::new(0),
            blocked: AtomicBool::new(false),
        })
    }

    /// Mints a fresh, unique consumer tag.
    pub(crate) fn next_consumer_tag(&self) -> String {
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        format!("consumer-{id}")
    }

    /// Reports whether the breaker currently guarding `connect()` is open.
    pub fn breaker_is_open(&self) -> bool {
        self.breaker.is_open()
    }

    /// Reports whether a reconnect cycle is currently running.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Relaxed)
    }

    /// Reports whether this supervisor has been permanently closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Returns the default channel, failing with `NotConnected` unless both
    /// the connection and the default channel are currently open.
    pub(crate) async fn default_channel(&self) -> CoreResult<Arc<dyn DriverChannel>> {
        let state = self.state.lock().await;

        match (&state.connection, &state.default_channel) {
            (Some(connection), Some(channel)) if connection.is_connected() && channel.is_open() => {
                Ok(channel.clone())
            }
            _ => Err(CoreError::new(ErrorCode::NotConnected, "no open connection")),
        }
    }

    fn connected_connection_sync(state: &State) -> Option<Arc<dyn DriverConnection>> {
        state.connection.clone()
    }

    /// Leases a channel from the pool. The pool is a separate,
    /// explicitly-acquired resource from the default channel used by
    /// `publish`/`consume`/topology operations.
    pub(crate) async fn acquire_pooled_channel(&self) -> CoreResult<crate::pool::LeasedChannel> {
        let connection = {
            let state = self.state.lock().await;

            match &state.connection {
                Some(connection) if connection.is_connected() => connection.clone(),
                _ => return Err(CoreError::new(ErrorCode::NotConnected, "no open connection")),
            }
        };

        self.pool.acquire(connection.as_ref()).await
    }

    /// Returns a previously leased pooled channel.
    pub(crate) async fn release_pooled_channel(&self, leased: crate::pool::LeasedChannel) {
        self.pool.release(leased).await;
    }
}

// ---------------------------------------------------------------------
// Connect / reconnect
// ---------------------------------------------------------------------

impl ConnectionSupervisor {
    /// Idempotently establishes the single active connection. Returns
    /// immediately if already connected; fails fast with `CircuitBreakerOpen`
    /// if the breaker is open and not eligible for a probe.
    pub async fn connect(self: &Arc<Self>) -> CoreResult<()> {
        if self.is_connected().await {
            return Ok(());
        }

        if self.breaker.is_open() && !self.breaker.should_probe() {
            return Err(CoreError::new(
                ErrorCode::CircuitBreakerOpen,
                "circuit breaker is open; refusing to attempt a connection",
            ));
        }

        // Serializes connect/reconnect/shutdown. Overlapping callers simply
        // queue here and, on acquiring the lock, observe the now-connected
        // state below rather than re-running the whole attempt themselves.
        let _guard = self.op_lock.lock().await;

        if self.is_connected().await {
            return Ok(());
        }

        self.events.emit(Event::Connecting);

        match self.establish_connection().await {
            Ok(connection) => {
                if let Err(error) = self.adopt_connection(connection).await {
                    self.breaker.record_failure();
                    self.events.emit(Event::ConnectionFailed(Arc::new(error.to_event_copy())));
                    return Err(error);
                }

                self.breaker.record_success();
                self.backoff.reset();
                self.events.emit(Event::Connected);
                Ok(())
            }
            Err(error) => {
                self.breaker.record_failure();
                self.events.emit(Event::ConnectionFailed(Arc::new(error.to_event_copy())));
                Err(error)
            }
        }
    }

    async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        matches!(&state.connection, Some(connection) if connection.is_connected())
    }

    /// Tries up to [`MAX_URL_ATTEMPTS`] candidate URLs (one ordered list per
    /// call), returning the first successful connection or a `Cluster` error
    /// aggregating every attempt's failure. The initial `connect()` call uses
    /// `connection_timeout` per attempt; subsequent reconnect cycles use
    /// `cluster.retry_connect_timeout` instead (see
    /// `establish_connection_for_reconnect`).
    async fn establish_connection(&self) -> CoreResult<Arc<dyn DriverConnection>> {
        self.establish_connection_with_timeout(self.config.connection_timeout).await
    }

    /// Same as [`establish_connection`](Self::establish_connection), but used
    /// by the reconnect loop with `cluster.retry_connect_timeout` as the
    /// per-attempt timeout instead of the initial-connect `connection_timeout`.
    async fn establish_connection_for_reconnect(&self) -> CoreResult<Arc<dyn DriverConnection>> {
        self.establish_connection_with_timeout(self.config.cluster.retry_connect_timeout)
            .await
    }

    async fn establish_connection_with_timeout(
        &self,
        per_attempt_timeout: Duration,
    ) -> CoreResult<Arc<dyn DriverConnection>> {
        let candidates = self.registry.candidates();

        if candidates.is_empty() {
            return Err(CoreError::new(ErrorCode::Cluster, "no broker URLs are configured"));
        }

        let mut error = CoreError::new(ErrorCode::Cluster, "every configured broker URL failed to connect");

        for url in candidates.into_iter().take(MAX_URL_ATTEMPTS) {
            match tokio::time::timeout(per_attempt_timeout, self.driver.connect(&url)).await {
                Ok(Ok(connection)) => {
                    self.registry.mark_healthy(&url);
                    return Ok(Arc::from(connection));
                }
                Ok(Err(attempt_error)) => {
                    self.registry.mark_unhealthy(&url);
                    warn!(url = %redact_url(&url), error = %attempt_error, "Failed to connect to broker node");
                    error = error.with_detail(redact_url(&url), attempt_error.to_string());
                }
                Err(_) => {
                    self.registry.mark_unhealthy(&url);
                    warn!(url = %redact_url(&url), "Connection attempt to broker node timed out");
                    error = error.with_detail(redact_url(&url), "connection attempt timed out".to_string());
                }
            }
        }

        Err(error)
    }

    /// Creates the default channel, (re)fills the pool, and swaps them into
    /// place as the current state.
    async fn adopt_connection(&self, connection: Arc<dyn DriverConnection>) -> CoreResult<()> {
        let default_channel: Arc<dyn DriverChannel> = Arc::from(connection.create_channel().await?);
        default_channel
            .set_prefetch(self.config.prefetch_count, self.config.prefetch_global)
            .await?;

        self.pool.clear().await;
        self.pool.prefill(connection.as_ref()).await?;

        let mut state = self.state.lock().await;
        state.connection = Some(connection);
        state.default_channel = Some(default_channel);

        Ok(())
    }

    /// Triggers a reconnect cycle in the background unless one is already
    /// running or shutdown has been armed. Safe to call repeatedly.
    pub fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_released() {
            return;
        }

        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.reconnect_loop().await;
            supervisor.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        if self.shutdown.is_released() {
            return;
        }

        let _guard = self.op_lock.lock().await;

        if self.shutdown.is_released() {
            return;
        }

        self.teardown().await;
        self.events.emit(Event::Reconnecting);

        loop {
            if self.shutdown.is_released() {
                return;
            }

            if self.config.max_reconnect_attempts >= 0
                && self.backoff.attempts() as i64 >= self.config.max_reconnect_attempts
            {
                let error = CoreError::new(
                    ErrorCode::Reconnection,
                    "reconnect attempts exhausted",
                )
                .with_detail("max_attempts", self.config.max_reconnect_attempts.to_string());
                self.events.emit(Event::ReconnectFailed(Arc::new(error.to_event_copy())));
                return;
            }

            self.backoff.sleep_next().await;

            match self.establish_connection_for_reconnect().await {
                Ok(connection) => match self.adopt_connection(connection).await {
                    Ok(()) => {
                        self.breaker.record_success();
                        self.backoff.reset();
                        self.metrics.record_reconnection();
                        self.events.emit(Event::Reconnected);
                        return;
                    }
                    Err(_error) => {
                        self.breaker.record_failure();
                        continue;
                    }
                },
                Err(_error) => {
                    self.breaker.record_failure();
                    continue;
                }
            }
        }
    }

    /// Force-closes the current connection and channels (swallowing close
    /// errors), in preparation for a reconnect cycle.
    async fn teardown(&self) {
        self.pool.close_all().await;

        let mut state = self.state.lock().await;

        if let Some(channel) = state.default_channel.take() {
            let _ = channel.close().await;
        }

        if let Some(connection) = state.connection.take() {
            let _ = connection.close().await;
        }
    }
}

// ---------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------

impl ConnectionSupervisor {
    /// Performs a lightweight broker probe: assert, check, and delete a
    /// transient queue on the default channel. Never panics or propagates;
    /// any failure simply yields `false`.
    pub async fn health_check(&self) -> bool {
        let channel = {
            let state = self.state.lock().await;

            match (&state.connection, &state.default_channel) {
                (Some(connection), Some(channel))
                    if connection.is_connected() && channel.is_open() =>
                {
                    channel.clone()
                }
                _ => return false,
            }
        };

        self.probe(channel.as_ref()).await.is_ok()
    }

    /// Polls the connection's flow-control status and emits `blocked`/
    /// `unblocked` on a transition. Run from the 30s connection-health tick
    /// rather than a push callback, per this seam's synchronous-query-only
    /// design (`DESIGN.md`).
    async fn check_blocked_transition(&self) {
        let connection = {
            let state = self.state.lock().await;
            Self::connected_connection_sync(&state)
        };

        let Some(connection) = connection else {
            return;
        };

        let now_blocked = connection.is_blocked();
        let was_blocked = self.blocked.swap(now_blocked, Ordering::Relaxed);

        if now_blocked && !was_blocked {
            self.events
                .emit(Event::Blocked("broker reported flow-control back-pressure".to_string()));
        } else if was_blocked && !now_blocked {
            self.events.emit(Event::Unblocked);
        }
    }

    async fn probe(&self, channel: &dyn DriverChannel) -> CoreResult<()> {
        use lapin::options::{QueueDeclareOptions, QueueDeleteOptions};
        use lapin::types::FieldTable;

        channel
            .declare_queue(
                HEALTH_CHECK_QUEUE,
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: false,
                    auto_delete: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .declare_queue(
                HEALTH_CHECK_QUEUE,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .delete_queue(HEALTH_CHECK_QUEUE, QueueDeleteOptions::default())
            .await?;

        Ok(())
    }
}

// ---------------------------------------------------------------------
// Close / graceful shutdown
// ---------------------------------------------------------------------

impl ConnectionSupervisor {
    /// Stops background tasks, closes every channel and the connection
    /// (ignoring errors), and emits `closed`. Idempotent: a second call is a
    /// no-op.
    pub async fn close(&self) -> CoreResult<()> {
        self.shutdown.release();
        self.close_resources().await
    }

    /// Same as [`close`](Self::close), but first blocks reconnect and waits
    /// up to 3s (polled every 100ms) for `messages_sent == messages_received`
    /// before proceeding.
    pub async fn graceful_shutdown(&self) -> CoreResult<()> {
        self.shutdown.release();

        let deadline = Instant::now() + Duration::from_secs(3);

        loop {
            let snapshot = self.metrics.snapshot();

            if snapshot.messages_sent == snapshot.messages_received {
                break;
            }

            if Instant::now() >= deadline {
                break;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.close_resources().await
    }

    async fn close_resources(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.pool.close_all().await;

        let mut state = self.state.lock().await;

        if let Some(channel) = state.default_channel.take() {
            let _ = channel.close().await;
        }

        if let Some(connection) = state.connection.take() {
            let _ = connection.close().await;
        }

        drop(state);

        self.events.emit(Event::Closed);

        Ok(())
    }
}

// ---------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------

impl ConnectionSupervisor {
    /// Spawns the four independent, non-overlapping periodic background
    /// tasks. Each stops as soon as this supervisor's shutdown latch is
    /// released.
    pub(crate) fn spawn_background_tasks(self: &Arc<Self>) {
        self.spawn_metrics_emitter();
        self.spawn_connection_health_task();
        self.spawn_channel_recovery_task();
        self.spawn_cluster_health_task();
    }

    fn spawn_metrics_emitter(self: &Arc<Self>) {
        let supervisor = self.clone();

        tokio::spawn(async move {
            let gate = supervisor.shutdown.gate();
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = gate.opened() => break,
                    _ = interval.tick() => {
                        supervisor.events.emit(Event::Metrics(supervisor.metrics.snapshot()));
                    }
                }
            }
        });
    }

    fn spawn_connection_health_task(self: &Arc<Self>) {
        let supervisor = self.clone();

        tokio::spawn(async move {
            let gate = supervisor.shutdown.gate();
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = gate.opened() => break,
                    _ = interval.tick() => {
                        if supervisor.is_reconnecting() || supervisor.shutdown.is_released() {
                            continue;
                        }

                        supervisor.check_blocked_transition().await;

                        if !supervisor.health_check().await {
                            supervisor.schedule_reconnect();
                        }
                    }
                }
            }
        });
    }

    fn spawn_channel_recovery_task(self: &Arc<Self>) {
        let supervisor = self.clone();

        tokio::spawn(async move {
            let gate = supervisor.shutdown.gate();
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = gate.opened() => break,
                    _ = interval.tick() => {
                        supervisor.channel_recovery_tick().await;
                    }
                }
            }
        });
    }

    async fn channel_recovery_tick(self: &Arc<Self>) {
        if self.shutdown.is_released() || self.is_reconnecting() {
            return;
        }

        if !self.config.channel_recovery.auto_recovery {
            return;
        }

        let connection = {
            let state = self.state.lock().await;
            Self::connected_connection_sync(&state)
        };

        let Some(connection) = connection else {
            return;
        };

        let default_channel_closed = {
            let state = self.state.lock().await;
            state
                .default_channel
                .as_ref()
                .map(|channel| !channel.is_open())
                .unwrap_or(true)
        };

        if default_channel_closed {
            self.events.emit(Event::ChannelClosed);

            if !self.recreate_default_channel(&connection).await {
                self.events.emit(Event::ChannelError(Arc::new(CoreError::new(
                    ErrorCode::Channel,
                    "failed to recreate the default channel after closure",
                ))));
                self.schedule_reconnect();
                return;
            }
        }

        self.pool.cleanup_stale_channels().await;

        let retries = self.config.channel_recovery.max_retries.max(1);
        let needed_refill = self.pool.len().await < self.config.pool.max_channels;

        for attempt in 0..retries {
            if self.pool.len().await >= self.config.pool.max_channels {
                break;
            }

            if self.pool.prefill(connection.as_ref()).await.is_ok() {
                if needed_refill {
                    self.events.emit(Event::ChannelDrain);
                }
                break;
            }

            if attempt + 1 < retries {
                tokio::time::sleep(self.config.channel_recovery.retry_delay).await;
            } else {
                self.events.emit(Event::ChannelError(Arc::new(CoreError::new(
                    ErrorCode::Channel,
                    "exhausted retries refilling the channel pool",
                ))));
                self.schedule_reconnect();
            }
        }
    }

    /// Attempts up to `channel_recovery.max_retries` times, spaced by
    /// `channel_recovery.retry_delay`, to recreate the default channel on the
    /// given connection. Returns whether it succeeded.
    async fn recreate_default_channel(&self, connection: &Arc<dyn DriverConnection>) -> bool {
        let retries = self.config.channel_recovery.max_retries.max(1);

        for attempt in 0..retries {
            match connection.create_channel().await {
                Ok(channel) => {
                    let channel: Arc<dyn DriverChannel> = Arc::from(channel);

                    if channel
                        .set_prefetch(self.config.prefetch_count, self.config.prefetch_global)
                        .await
                        .is_err()
                    {
                        warn!("Failed to re-apply prefetch to a recreated default channel");
                    }

                    let mut state = self.state.lock().await;
                    state.default_channel = Some(channel);

                    return true;
                }
                Err(error) => {
                    warn!(?error, error_message = %error, attempt, "Failed to recreate the default channel");

                    if attempt + 1 < retries {
                        tokio::time::sleep(self.config.channel_recovery.retry_delay).await;
                    }
                }
            }
        }

        false
    }

    fn spawn_cluster_health_task(self: &Arc<Self>) {
        let Some(interval_duration) = self.config.cluster.node_recovery_interval else {
            return;
        };

        let supervisor = self.clone();

        tokio::spawn(async move {
            let gate = supervisor.shutdown.gate();
            let mut interval = tokio::time::interval(interval_duration);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = gate.opened() => break,
                    _ = interval.tick() => {
                        supervisor.cluster_health_tick().await;
                    }
                }
            }
        });
    }

    async fn cluster_health_tick(&self) {
        const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

        for node in self.registry.snapshot() {
            let url = node.url().to_string();

            match tokio::time::timeout(PROBE_TIMEOUT, self.driver.connect(&url)).await {
                Ok(Ok(connection)) => {
                    let _ = connection.close().await;
                    self.registry.mark_healthy(&url);
                }
                Ok(Err(error)) => {
                    warn!(url = %redact_url(&url), error = %error, "Cluster node health probe failed");
                    self.registry.mark_unhealthy(&url);
                }
                Err(_) => {
                    warn!(url = %redact_url(&url), "Cluster node health probe timed out");
                    self.registry.mark_unhealthy(&url);
                }
            }
        }

        info!(
            nodes = self.registry.snapshot().len(),
            "Completed a cluster-node health sweep",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::driver::mock::MockDriver;
    use pretty_assertions::assert_eq;

    fn test_config(urls: &[&str]) -> Config {
        Config {
            urls: urls.iter().map(|s| s.to_string()).collect(),
            reconnect_delay_millis: 1,
            breaker: BreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_millis(50),
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn default_channel_requires_a_live_connection() {
        // Given
        let driver = Arc::new(MockDriver::new());
        let supervisor = ConnectionSupervisor::new(test_config(&["amqp://node-a"]), driver);

        // When
        let before = supervisor.default_channel().await;

        // Then
        assert_eq!(before.unwrap_err().code(), ErrorCode::NotConnected);

        // When
        supervisor.connect().await.unwrap();

        // Then
        assert!(supervisor.default_channel().await.is_ok());
    }

    #[tokio::test]
    async fn connect_is_idempotent_once_established() {
        // Given
        let driver = Arc::new(MockDriver::new());
        let supervisor = ConnectionSupervisor::new(test_config(&["amqp://node-a"]), driver.clone());

        // When
        supervisor.connect().await.unwrap();
        supervisor.connect().await.unwrap();

        // Then: a second call observes the already-connected state instead
        // of dialing again.
        assert_eq!(driver.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn establish_connection_falls_back_to_the_next_candidate() {
        // Given
        let driver = Arc::new(MockDriver::new());
        driver.script_connects([false, true]);
        let config = test_config(&["amqp://node-a", "amqp://node-b"]);
        let supervisor = ConnectionSupervisor::new(config, driver.clone());

        // When
        let result = supervisor.connect().await;

        // Then
        assert!(result.is_ok());
        assert_eq!(driver.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn connect_fails_fast_once_breaker_is_open() {
        // Given
        let driver = Arc::new(MockDriver::new());
        driver.script_connects([false, false]);
        let supervisor = ConnectionSupervisor::new(test_config(&["amqp://node-a"]), driver);

        // When
        supervisor.connect().await.unwrap_err();
        supervisor.connect().await.unwrap_err();

        // Then
        assert!(supervisor.breaker_is_open());

        // When
        let result = supervisor.connect().await;

        // Then
        assert_eq!(result.unwrap_err().code(), ErrorCode::CircuitBreakerOpen);
    }

    #[tokio::test]
    async fn health_check_is_false_before_connecting() {
        // Given
        let driver = Arc::new(MockDriver::new());
        let supervisor = ConnectionSupervisor::new(test_config(&["amqp://node-a"]), driver);

        // Then
        assert!(!supervisor.health_check().await);
    }

    #[tokio::test]
    async fn health_check_is_true_after_connecting() {
        // Given
        let driver = Arc::new(MockDriver::new());
        let supervisor = ConnectionSupervisor::new(test_config(&["amqp://node-a"]), driver);
        supervisor.connect().await.unwrap();

        // Then
        assert!(supervisor.health_check().await);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        // Given
        let driver = Arc::new(MockDriver::new());
        let supervisor = ConnectionSupervisor::new(test_config(&["amqp://node-a"]), driver);
        supervisor.connect().await.unwrap();

        // When
        supervisor.close().await.unwrap();
        supervisor.close().await.unwrap();

        // Then
        assert!(supervisor.is_closed());
    }

    #[tokio::test]
    async fn graceful_shutdown_returns_promptly_when_counters_are_balanced() {
        // Given
        let driver = Arc::new(MockDriver::new());
        let supervisor = ConnectionSupervisor::new(test_config(&["amqp://node-a"]), driver);
        supervisor.connect().await.unwrap();

        // When
        let started = Instant::now();
        supervisor.graceful_shutdown().await.unwrap();

        // Then
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn schedule_reconnect_reestablishes_the_connection() {
        // Given
        let driver = Arc::new(MockDriver::new());
        let supervisor = ConnectionSupervisor::new(test_config(&["amqp://node-a"]), driver.clone());
        supervisor.connect().await.unwrap();
        driver.script_connects([true]);

        // When
        supervisor.schedule_reconnect();

        for _ in 0..50 {
            if !supervisor.is_reconnecting() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Then
        assert!(!supervisor.is_reconnecting());
        assert!(supervisor.default_channel().await.is_ok());
        assert_eq!(supervisor.metrics.snapshot().reconnections, 1);
    }

    #[tokio::test]
    async fn channel_recovery_tick_emits_channel_drain_after_refilling_pool() {
        // Given
        let driver = Arc::new(MockDriver::new());
        let supervisor = ConnectionSupervisor::new(test_config(&["amqp://node-a"]), driver);
        supervisor.connect().await.unwrap();
        supervisor.pool.clear().await;

        let drained = Arc::new(AtomicBool::new(false));
        supervisor.events.subscribe({
            let drained = drained.clone();
            move |event| {
                if matches!(event, Event::ChannelDrain) {
                    drained.store(true, Ordering::Relaxed);
                }
            }
        });

        // When
        supervisor.channel_recovery_tick().await;

        // Then
        assert!(drained.load(Ordering::Relaxed));
        assert_eq!(supervisor.pool.len().await, supervisor.config.pool.max_channels);
    }
}
