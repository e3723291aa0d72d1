use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::coordinator::Coordinator;
use crate::coordinator::Waiter;
use crate::error::LimiterError;
use crate::error::Result;
use crate::permits::CountedPermit;
use crate::permits::Permits;
use crate::permits::request;
use crate::state::Lifecycle;
use crate::state::Shared;

/// Emits permits at a fixed interval, at most `limit` of them per reset
/// window.
///
/// The limiter starts running as soon as it is constructed. A background
/// task ticks every `tick_interval` and hands one permit to one waiting
/// consumer per tick. When the window's permits are used up further ticks are
/// absorbed until `reset_interval` has elapsed, at which point the window is
/// replenished to `limit`. The first window starts at construction.
///
/// Share a limiter between tasks with an `Arc`. Dropping the last owner stops
/// it.
#[derive(Debug)]
pub struct PacedLimiter {
    shared: Arc<Shared>,
    tick_interval: Duration,
    reset_interval: Duration,
    waiters: mpsc::UnboundedSender<Waiter>,
    shutdown: CancellationToken,
}

impl PacedLimiter {
    /// Creates and starts a new `PacedLimiter`.
    ///
    /// # Arguments
    ///
    /// * `tick_interval` - The spacing between permit opportunities.
    /// * `limit` - The maximum number of permits per window. A limit of zero
    ///   is accepted but never yields a permit.
    /// * `reset_interval` - The length of a window.
    ///
    /// # Errors
    ///
    /// Returns `LimiterError::InvalidConfig` if either duration is zero and
    /// `LimiterError::NoRuntime` when called outside a tokio runtime.
    pub fn new(tick_interval: Duration, limit: usize, reset_interval: Duration) -> Result<Self> {
        if tick_interval.is_zero() {
            return Err(LimiterError::InvalidConfig(
                "tick interval must be greater than zero",
            ));
        }
        if reset_interval.is_zero() {
            return Err(LimiterError::InvalidConfig(
                "reset interval must be greater than zero",
            ));
        }
        let runtime = Handle::try_current().map_err(|_| LimiterError::NoRuntime)?;

        let shared = Arc::new(Shared::new(limit));
        let (waiters, queue) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let coordinator = Coordinator::new(
            Arc::clone(&shared),
            tick_interval,
            reset_interval,
            queue,
            shutdown.clone(),
        );
        runtime.spawn(coordinator.run());

        Ok(Self {
            shared,
            tick_interval,
            reset_interval,
            waiters,
            shutdown,
        })
    }

    /// Create a builder for configuring a limiter.
    pub fn builder() -> PacedLimiterBuilder {
        PacedLimiterBuilder::default()
    }

    /// Waits for the next permit and counts it against the window.
    ///
    /// Returns the instant at which the permit's tick fired.
    ///
    /// # Errors
    ///
    /// Returns `LimiterError::Stopped` once the limiter has been stopped,
    /// without blocking. A wait already in progress when the limiter stops
    /// resolves with the same error.
    pub async fn wait(&self) -> Result<Instant> {
        if self.shared.lifecycle() != Lifecycle::Active {
            return Err(LimiterError::Stopped);
        }
        let permit = request(&self.waiters, true)?;
        CountedPermit::new(permit, Arc::clone(&self.shared)).await
    }

    /// A raw stream of permits for consumers that do their own accounting.
    ///
    /// See [`Permits`] for the bookkeeping this requires. Do not mix it with
    /// [`wait`](Self::wait) on the same limiter.
    pub fn permits(&self) -> Permits {
        Permits::new(self.waiters.clone())
    }

    /// Counts one permit taken from [`permits`](Self::permits) against the
    /// window.
    ///
    /// # Errors
    ///
    /// Returns `LimiterError::Overcount` if no permits remain. The counter
    /// stays at zero.
    pub fn count(&self) -> Result<()> {
        self.shared.count().inspect_err(|_| {
            warn!(limit = self.shared.limit(), "permit counted with none remaining");
        })
    }

    /// The number of permits left before the limiter waits for a reset.
    pub fn remaining(&self) -> usize {
        self.shared.remaining()
    }

    /// Permits allowed per reset window.
    pub fn limit(&self) -> usize {
        self.shared.limit()
    }

    /// The spacing between permits.
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// How long a window lasts before it is replenished.
    pub fn reset_interval(&self) -> Duration {
        self.reset_interval
    }

    /// Where the limiter is between running and stopped.
    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    /// True once a stop has been requested, whether or not the permit
    /// stream has closed yet.
    pub fn is_stopped(&self) -> bool {
        self.lifecycle() != Lifecycle::Active
    }

    /// Stops the limiter.
    ///
    /// Calling this more than once is harmless. The permit stream is closed
    /// by the background task shortly after; await [`closed`](Self::closed)
    /// to observe it.
    pub fn stop(&self) {
        if self.shared.begin_stop() {
            debug!("stop requested");
            self.shutdown.cancel();
        }
    }

    /// Completes once the permit stream has closed.
    pub async fn closed(&self) {
        self.waiters.closed().await
    }
}

impl Drop for PacedLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builder for configuring a [`PacedLimiter`].
#[derive(Debug, Default, Clone)]
pub struct PacedLimiterBuilder {
    tick_interval: Option<Duration>,
    limit: Option<usize>,
    reset_interval: Option<Duration>,
}

impl PacedLimiterBuilder {
    /// Set the spacing between permits.
    pub fn tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = Some(tick_interval);
        self
    }

    /// Set the maximum number of permits per window.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the window length.
    pub fn reset_interval(mut self, reset_interval: Duration) -> Self {
        self.reset_interval = Some(reset_interval);
        self
    }

    /// Build and start the limiter.
    ///
    /// # Errors
    ///
    /// Returns `LimiterError::InvalidConfig` if any value is unset, otherwise
    /// whatever [`PacedLimiter::new`] returns.
    pub fn build(self) -> Result<PacedLimiter> {
        let tick_interval = self
            .tick_interval
            .ok_or(LimiterError::InvalidConfig("tick interval must be set"))?;
        let limit = self
            .limit
            .ok_or(LimiterError::InvalidConfig("limit must be set"))?;
        let reset_interval = self
            .reset_interval
            .ok_or(LimiterError::InvalidConfig("reset interval must be set"))?;
        PacedLimiter::new(tick_interval, limit, reset_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_requires_a_runtime() {
        let res = PacedLimiter::new(Duration::from_millis(10), 1, Duration::from_secs(1));
        assert_eq!(res.unwrap_err(), LimiterError::NoRuntime);
    }

    #[tokio::test]
    async fn it_rejects_zero_durations() {
        let res = PacedLimiter::new(Duration::ZERO, 1, Duration::from_secs(1));
        assert!(matches!(res, Err(LimiterError::InvalidConfig(_))));

        let res = PacedLimiter::new(Duration::from_millis(10), 1, Duration::ZERO);
        assert!(matches!(res, Err(LimiterError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn builder_requires_every_value() {
        let res = PacedLimiter::builder()
            .tick_interval(Duration::from_millis(10))
            .limit(5)
            .build();
        assert_eq!(
            res.unwrap_err(),
            LimiterError::InvalidConfig("reset interval must be set")
        );

        let limiter = PacedLimiter::builder()
            .tick_interval(Duration::from_millis(10))
            .limit(5)
            .reset_interval(Duration::from_secs(1))
            .build()
            .unwrap();
        assert_eq!(limiter.limit(), 5);
        assert_eq!(limiter.remaining(), 5);
        assert_eq!(limiter.tick_interval(), Duration::from_millis(10));
        assert_eq!(limiter.reset_interval(), Duration::from_secs(1));
        assert_eq!(limiter.lifecycle(), Lifecycle::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let limiter =
            PacedLimiter::new(Duration::from_millis(10), 5, Duration::from_secs(1)).unwrap();

        limiter.stop();
        limiter.stop();
        assert!(limiter.is_stopped());

        limiter.closed().await;
        assert_eq!(limiter.lifecycle(), Lifecycle::Stopped);

        limiter.stop();
        assert_eq!(limiter.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn count_reports_overcount() {
        let limiter =
            PacedLimiter::new(Duration::from_millis(10), 2, Duration::from_secs(1)).unwrap();

        assert_eq!(limiter.count(), Ok(()));
        assert_eq!(limiter.count(), Ok(()));
        assert_eq!(limiter.count(), Err(LimiterError::Overcount));
        assert_eq!(limiter.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_never_emits() {
        let limiter =
            PacedLimiter::new(Duration::from_millis(10), 0, Duration::from_millis(100)).unwrap();

        let res = tokio::time::timeout(Duration::from_secs(5), limiter.wait()).await;
        assert!(res.is_err(), "a zero limit should never yield a permit");
        assert_eq!(limiter.remaining(), 0);
    }
}
