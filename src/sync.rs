use tokio_util::sync::CancellationToken;

/// A synchronization primitive that can be released exactly once, notifying
/// all associated [`Gate`]s. Used as this crate's per-[`Client`](crate::Client)
/// shutdown signal.
///
/// Owned by a single `Client` instance rather than a process-wide singleton
/// token: shutdown is monotonic per client, not process-wide, so multiple
/// independent clients can shut down independently of one another.
#[derive(Debug, Default, Clone)]
pub struct Latch {
    token: CancellationToken,
}

/// A single-release barrier that is [opened](Gate::opened) when the
/// associated [`Latch`] is [released](Latch::release).
#[derive(Debug, Clone)]
pub struct Gate {
    token: CancellationToken,
}

impl Latch {
    /// Returns a brand new, unreleased [`Latch`].
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Returns a new [`Gate`] handle linked to this latch.
    pub fn gate(&self) -> Gate {
        Gate {
            token: self.token.clone(),
        }
    }

    /// Permanently releases this latch. Subsequent calls have no additional
    /// effect.
    pub fn release(&self) {
        self.token.cancel();
    }

    /// Reports whether this latch has been released.
    pub fn is_released(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Gate {
    /// Waits until the associated latch is [released](Latch::release).
    /// Resolves immediately if already released.
    pub async fn opened(&self) {
        self.token.cancelled().await;
    }

    /// Reports whether the associated latch has been released.
    pub fn is_open(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn gate_opens_after_release() {
        // Given
        let latch = Latch::new();
        let gate = latch.gate();
        let marker = Arc::new(AtomicBool::new(false));

        tokio::spawn({
            let marker = marker.clone();
            async move {
                gate.opened().await;
                marker.store(true, Ordering::Relaxed);
            }
        });

        // When
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!marker.load(Ordering::Relaxed));
        latch.release();
        tokio::time::sleep(Duration::from_millis(2)).await;

        // Then
        assert!(marker.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn gate_resolves_immediately_if_already_released() {
        // Given
        let latch = Latch::new();
        latch.release();
        let gate = latch.gate();

        // When / Then
        gate.opened().await;
        assert!(gate.is_open());
    }

    #[test]
    fn release_is_idempotent() {
        // Given
        let latch = Latch::new();

        // When
        latch.release();
        latch.release();

        // Then
        assert!(latch.is_released());
    }
}
