use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio::time::interval_at;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use crate::state::Shared;

/// A consumer queued on the permit stream.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) reply: oneshot::Sender<Instant>,
    /// Take the permit out of the window as part of the hand-off.
    pub(crate) counted: bool,
}

enum Handoff {
    Delivered,
    Exhausted,
    Shutdown,
}

/// The single task that owns the ticker and the reset window.
///
/// Every suspension point races the shutdown token, so a stop is observed
/// while waiting for a tick, for a consumer, or for the window to reset.
pub(crate) struct Coordinator {
    shared: Arc<Shared>,
    tick_interval: Duration,
    reset_interval: Duration,
    waiters: mpsc::UnboundedReceiver<Waiter>,
    /// A consumer that arrived after the window ran dry. Served first.
    parked: Option<Waiter>,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub(crate) fn new(
        shared: Arc<Shared>,
        tick_interval: Duration,
        reset_interval: Duration,
        waiters: mpsc::UnboundedReceiver<Waiter>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared,
            tick_interval,
            reset_interval,
            waiters,
            parked: None,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        let started = Instant::now();
        let mut ticker = interval_at(started + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut window_ends = started + self.reset_interval;

        debug!(
            tick_interval = ?self.tick_interval,
            limit = self.shared.limit(),
            reset_interval = ?self.reset_interval,
            "paced limiter started"
        );

        loop {
            let fired_at = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                fired_at = ticker.tick() => fired_at,
            };

            let exhausted = if self.shared.remaining() == 0 {
                trace!("tick absorbed, window exhausted");
                true
            } else {
                match self.hand_off(fired_at).await {
                    Handoff::Delivered => {
                        // A consumer that kept us waiting pushes the schedule back.
                        if fired_at.elapsed() >= self.tick_interval {
                            ticker.reset();
                        }
                        false
                    }
                    Handoff::Exhausted => true,
                    Handoff::Shutdown => break,
                }
            };

            if exhausted {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = sleep_until(window_ends) => {}
                }
                window_ends = Instant::now() + self.reset_interval;
                self.shared.replenish();
                ticker.reset_immediately();
                debug!(remaining = self.shared.limit(), "window reset");
            }
        }

        self.close();
    }

    /// Give the permit fired at `fired_at` to exactly one live consumer.
    async fn hand_off(&mut self, fired_at: Instant) -> Handoff {
        loop {
            let waiter = match self.parked.take() {
                Some(waiter) => waiter,
                None => tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return Handoff::Shutdown,
                    waiter = self.waiters.recv() => match waiter {
                        Some(waiter) => waiter,
                        // Every handle is gone.
                        None => return Handoff::Shutdown,
                    },
                },
            };

            if waiter.reply.is_closed() {
                continue;
            }

            let taken = if waiter.counted {
                self.shared.try_take()
            } else {
                self.shared.remaining() > 0
            };
            if !taken {
                // Raw stream consumers counted the window dry while we waited.
                self.parked = Some(waiter);
                return Handoff::Exhausted;
            }

            let Waiter { reply, counted } = waiter;
            if reply.send(fired_at).is_ok() {
                trace!(counted, remaining = self.shared.remaining(), "permit delivered");
                return Handoff::Delivered;
            }
            if counted {
                self.shared.restore();
            }
        }
    }

    fn close(mut self) {
        self.shared.mark_stopped();
        self.waiters.close();
        self.parked = None;
        // Dropping the queued reply slots wakes their consumers with `Stopped`.
        while self.waiters.try_recv().is_ok() {}
        debug!("paced limiter stopped");
    }
}
