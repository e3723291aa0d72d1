use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::error::LimiterError;
use crate::error::Result;

/// Where a limiter is in its one-way life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Ticking and handing out permits.
    Active = 0,
    /// A stop was requested; the coordination loop has not yet exited.
    Stopping = 1,
    /// The permit stream is closed.
    Stopped = 2,
}

impl Lifecycle {
    fn from_repr(value: u8) -> Self {
        match value {
            0 => Lifecycle::Active,
            1 => Lifecycle::Stopping,
            _ => Lifecycle::Stopped,
        }
    }
}

/// Counter and lifecycle flag shared between the coordination loop and
/// every handle onto the limiter.
///
/// `remaining` never leaves `[0, limit]`: decrements go through
/// `fetch_update` and refuse to pass zero, and the only increment is the
/// single store performed on replenish.
#[derive(Debug)]
pub(crate) struct Shared {
    limit: usize,
    remaining: AtomicUsize,
    lifecycle: AtomicU8,
}

impl Shared {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            remaining: AtomicUsize::new(limit),
            lifecycle: AtomicU8::new(Lifecycle::Active as u8),
        }
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Take one permit from the window if any remain.
    pub(crate) fn try_take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |val| {
                if val > 0 { Some(val - 1) } else { None }
            })
            .is_ok()
    }

    /// Manual bookkeeping for permits received from the raw stream.
    pub(crate) fn count(&self) -> Result<()> {
        if self.try_take() {
            Ok(())
        } else {
            Err(LimiterError::Overcount)
        }
    }

    /// Hand back a permit that was taken but could not be delivered.
    pub(crate) fn restore(&self) {
        let _ = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |val| {
                if val < self.limit { Some(val + 1) } else { None }
            });
    }

    pub(crate) fn replenish(&self) {
        self.remaining.store(self.limit, Ordering::Release);
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_repr(self.lifecycle.load(Ordering::Acquire))
    }

    /// Move from `Active` to `Stopping`. Only the first caller wins.
    pub(crate) fn begin_stop(&self) -> bool {
        self.lifecycle
            .compare_exchange(
                Lifecycle::Active as u8,
                Lifecycle::Stopping as u8,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub(crate) fn mark_stopped(&self) {
        self.lifecycle
            .store(Lifecycle::Stopped as u8, Ordering::Release);
    }
}
