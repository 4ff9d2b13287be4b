use crate::driver::{DriverChannel, DriverConnection};
use crate::error::{CoreError, ErrorCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// How often [`ChannelPool::acquire`] polls for a freed channel while
/// waiting.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Entry {
    id: u64,
    channel: Arc<dyn DriverChannel>,
    in_use: bool,
}

/// A channel leased out of a [`ChannelPool`]. Callers must
/// [`release`](ChannelPool::release) it back when done; this type does not
/// release on drop.
pub struct LeasedChannel {
    id: u64,
    channel: Arc<dyn DriverChannel>,
}

impl LeasedChannel {
    /// The underlying driver channel.
    pub fn channel(&self) -> &Arc<dyn DriverChannel> {
        &self.channel
    }
}

/// A bounded pool of confirm-mode channels, separate from the client's
/// default channel.
///
/// Generalizes "one channel per request, connection-owned" into "a bounded
/// reusable set with a FIFO-ish acquire/release contract".
pub struct ChannelPool {
    entries: Mutex<Vec<Entry>>,
    max_channels: usize,
    acquire_timeout: Duration,
    next_id: AtomicU64,
}

impl ChannelPool {
    /// Builds an empty pool with the given capacity and acquire timeout.
    pub fn new(max_channels: usize, acquire_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_channels,
            acquire_timeout,
            next_id: AtomicU64::new(0),
        }
    }

    /// The number of channels currently tracked by the pool (free + in-use).
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Opens channels (as free, not leased) until the pool reaches its
    /// configured capacity. Called once per successful `connect()`.
    pub async fn prefill(&self, connection: &dyn DriverConnection) -> Result<(), CoreError> {
        loop {
            let needed = {
                let entries = self.entries.lock().await;
                self.max_channels.saturating_sub(entries.len())
            };

            if needed == 0 {
                return Ok(());
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let channel: Arc<dyn DriverChannel> = Arc::from(connection.create_channel().await?);

            self.entries.lock().await.push(Entry {
                id,
                channel,
                in_use: false,
            });
        }
    }

    /// Removes every entry from the pool without closing them explicitly
    /// (the caller is expected to be discarding the owning connection,
    /// which takes the channels down with it).
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Leases a channel: reuses a free open one, opens a fresh one under
    /// capacity, or waits (polling every 100 ms) for one to free up until
    /// `acquireTimeout` elapses.
    pub async fn acquire(
        &self,
        connection: &dyn DriverConnection,
    ) -> Result<LeasedChannel, CoreError> {
        let deadline = Instant::now() + self.acquire_timeout;

        loop {
            {
                let mut entries = self.entries.lock().await;

                if let Some(entry) = entries
                    .iter_mut()
                    .find(|entry| !entry.in_use && entry.channel.is_open())
                {
                    entry.in_use = true;
                    return Ok(LeasedChannel {
                        id: entry.id,
                        channel: entry.channel.clone(),
                    });
                }

                if entries.len() < self.max_channels {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    drop(entries);

                    let channel: Arc<dyn DriverChannel> =
                        Arc::from(connection.create_channel().await?);

                    let mut entries = self.entries.lock().await;
                    entries.push(Entry {
                        id,
                        channel: channel.clone(),
                        in_use: true,
                    });

                    return Ok(LeasedChannel { id, channel });
                }
            }

            if Instant::now() >= deadline {
                return Err(CoreError::new(
                    ErrorCode::ChannelAcquisitionTimeout,
                    "timed out waiting for a free channel",
                )
                .with_detail("max_channels", self.max_channels.to_string()));
            }

            sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    /// Returns a previously leased channel to the free pool. A no-op if the
    /// channel was already released or has since been removed by
    /// [`cleanup_stale_channels`](Self::cleanup_stale_channels).
    pub async fn release(&self, leased: LeasedChannel) {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.iter_mut().find(|entry| entry.id == leased.id) {
            entry.in_use = false;
        }
    }

    /// Removes every closed entry from the pool, whether free or in-use.
    pub async fn cleanup_stale_channels(&self) {
        let mut entries = self.entries.lock().await;

        entries.retain(|entry| entry.channel.is_open());
    }

    /// Closes every channel currently tracked by the pool, ignoring
    /// individual close errors, and empties it. Called once by
    /// [`close`](crate::Client::close)/`graceful_shutdown`.
    pub async fn close_all(&self) {
        let mut entries = self.entries.lock().await;

        for entry in entries.drain(..) {
            let _ = entry.channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::driver::Driver;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn acquire_opens_channels_up_to_capacity() {
        // Given
        let driver = MockDriver::new();
        let connection = driver.connect("amqp://node-a").await.unwrap();
        let pool = ChannelPool::new(2, Duration::from_millis(500));

        // When
        let first = pool.acquire(connection.as_ref()).await.unwrap();
        let second = pool.acquire(connection.as_ref()).await.unwrap();

        // Then
        assert_eq!(pool.len().await, 2);
        pool.release(first).await;
        pool.release(second).await;
    }

    #[tokio::test]
    async fn acquire_reuses_released_channel_instead_of_opening_new() {
        // Given
        let driver = MockDriver::new();
        let connection = driver.connect("amqp://node-a").await.unwrap();
        let pool = ChannelPool::new(1, Duration::from_millis(500));
        let leased = pool.acquire(connection.as_ref()).await.unwrap();

        // When
        pool.release(leased).await;
        let reused = pool.acquire(connection.as_ref()).await;

        // Then
        assert!(reused.is_ok());
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_pool_is_exhausted() {
        // Given
        let driver = MockDriver::new();
        let connection = driver.connect("amqp://node-a").await.unwrap();
        let pool = ChannelPool::new(1, Duration::from_millis(250));
        let _leased = pool.acquire(connection.as_ref()).await.unwrap();

        // When
        let started = Instant::now();
        let result = pool.acquire(connection.as_ref()).await;
        let elapsed = started.elapsed();

        // Then
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().code(),
            ErrorCode::ChannelAcquisitionTimeout
        );
        assert!(elapsed >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn cleanup_is_a_no_op_while_all_entries_are_open() {
        // Given
        let driver = MockDriver::new();
        let connection = driver.connect("amqp://node-a").await.unwrap();
        let pool = ChannelPool::new(2, Duration::from_millis(500));
        let leased = pool.acquire(connection.as_ref()).await.unwrap();
        pool.release(leased).await;

        // When
        pool.cleanup_stale_channels().await;

        // Then
        assert_eq!(pool.len().await, 1);
    }
}
