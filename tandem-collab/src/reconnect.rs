//! Reconnection controller: exponential backoff with jitter.
//!
//! ```text
//! attempt n ──► delay = min(ceiling, base · multiplier^n) · U(1-j, 1+j)
//!                         (clamped to ceiling)
//!   Synced    ──► reset(): attempt counter back to 0
//!   disconnect ──► CancelHandle::cancel(): pending wait ends at once
//! ```
//!
//! Randomness comes from a seedable `StdRng` so tests can pin the jitter.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;

/// Backoff tuning. Defaults: 500 ms base, 30 s ceiling, ×2, ±50 % jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any delay, jitter included
    pub ceiling: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Relative jitter in `[0, 1]`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl BackoffConfig {
    /// Delay for attempt `attempt` before jitter.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = (self.base.as_secs_f64() * exp).min(self.ceiling.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Jittered delay for attempt `attempt`, never above the ceiling.
    #[must_use]
    pub fn duration(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let raw = self.raw_delay(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rng.random_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        Duration::from_secs_f64((raw * factor).min(self.ceiling.as_secs_f64()))
    }
}

/// Attempt counter plus RNG. Attempts are independent of each other.
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0, rng: StdRng::from_os_rng() }
    }

    /// Deterministic jitter for tests.
    pub fn with_seed(config: BackoffConfig, seed: u64) -> Self {
        Self { config, attempt: 0, rng: StdRng::seed_from_u64(seed) }
    }

    /// Delay before the next attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.duration(self.attempt, &mut self.rng);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Call after a completed handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

/// How a backoff wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed(Duration),
    Cancelled,
}

/// Cancels every current and future wait of its [`CancelToken`]s.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

/// Observes a [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Create a linked handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: std::sync::Arc::new(tx) }, CancelToken { rx })
}

impl CancelHandle {
    /// Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Never resolves if the handle is dropped
    /// without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Backoff {
    /// Sleep for the next delay unless cancelled first.
    pub async fn wait(&mut self, token: &mut CancelToken) -> WaitOutcome {
        if token.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        let delay = self.next_delay();
        log::debug!("Reconnecting in {delay:?} (attempt {})", self.attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => WaitOutcome::Elapsed(delay),
            _ = token.cancelled() => WaitOutcome::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_delay_grows_and_caps() {
        let config = BackoffConfig::default();
        assert_eq!(config.raw_delay(0), Duration::from_millis(500));
        assert_eq!(config.raw_delay(1), Duration::from_secs(1));
        assert_eq!(config.raw_delay(3), Duration::from_secs(4));
        assert_eq!(config.raw_delay(10), Duration::from_secs(30));
        assert_eq!(config.raw_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = BackoffConfig::default();
        let mut backoff = Backoff::with_seed(config.clone(), 7);
        for attempt in 0..40 {
            let raw = config.raw_delay(attempt).as_secs_f64();
            let delay = backoff.next_delay().as_secs_f64();
            assert!(delay >= raw * 0.5 - 1e-9, "attempt {attempt}: {delay} < {raw}/2");
            assert!(delay <= (raw * 1.5).min(30.0) + 1e-9);
        }
    }

    #[test]
    fn test_seeded_backoff_is_deterministic() {
        let mut a = Backoff::with_seed(BackoffConfig::default(), 42);
        let mut b = Backoff::with_seed(BackoffConfig::default(), 42);
        for _ in 0..10 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }

    #[test]
    fn test_reset() {
        let config = BackoffConfig { jitter: 0.0, ..Default::default() };
        let mut backoff = Backoff::with_seed(config, 1);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_wait_elapses() {
        let config = BackoffConfig { base: Duration::from_millis(10), jitter: 0.0, ..Default::default() };
        let mut backoff = Backoff::with_seed(config, 1);
        let (_handle, mut token) = cancel_pair();
        assert_eq!(
            backoff.wait(&mut token).await,
            WaitOutcome::Elapsed(Duration::from_millis(10))
        );
    }

    #[tokio::test]
    async fn test_wait_after_cancel_returns_immediately() {
        let mut backoff = Backoff::with_seed(BackoffConfig::default(), 1);
        let (handle, mut token) = cancel_pair();
        handle.cancel();
        assert_eq!(backoff.wait(&mut token).await, WaitOutcome::Cancelled);
        assert_eq!(backoff.attempt(), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let config = BackoffConfig {
            base: Duration::from_secs(3600),
            ceiling: Duration::from_secs(3600),
            ..Default::default()
        };
        let mut backoff = Backoff::with_seed(config, 1);
        let (handle, mut token) = cancel_pair();

        let waiter = tokio::spawn(async move { backoff.wait(&mut token).await });
        tokio::task::yield_now().await;
        handle.cancel();
        handle.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("wait should end promptly")
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(handle.is_cancelled());
    }
}
