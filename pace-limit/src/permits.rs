use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use futures::stream::FusedStream;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use crate::coordinator::Waiter;
use crate::error::LimiterError;
use crate::error::Result;
use crate::state::Shared;

/// Queue a reply slot with the coordination loop.
pub(crate) fn request(
    waiters: &mpsc::UnboundedSender<Waiter>,
    counted: bool,
) -> Result<oneshot::Receiver<Instant>> {
    let (reply, permit) = oneshot::channel();
    waiters
        .send(Waiter { reply, counted })
        .map_err(|_| LimiterError::Stopped)?;
    Ok(permit)
}

/// A counted reply slot.
///
/// The loop takes the permit out of the window before it sends. If the
/// owner gives up after the send but before reading the reply, dropping
/// the slot puts the permit back.
pub(crate) struct CountedPermit {
    permit: oneshot::Receiver<Instant>,
    shared: Arc<Shared>,
}

impl CountedPermit {
    pub(crate) fn new(permit: oneshot::Receiver<Instant>, shared: Arc<Shared>) -> Self {
        Self { permit, shared }
    }
}

impl Future for CountedPermit {
    type Output = Result<Instant>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().permit)
            .poll(cx)
            .map_err(|_| LimiterError::Stopped)
    }
}

impl Drop for CountedPermit {
    fn drop(&mut self) {
        // Closing first settles the race with an in-flight send: either the
        // send fails and the loop restores, or the value is here.
        self.permit.close();
        if self.permit.try_recv().is_ok() {
            self.shared.restore();
            trace!(remaining = self.shared.remaining(), "unread permit returned");
        }
    }
}

/// The raw permit stream of a [`PacedLimiter`](crate::PacedLimiter).
///
/// Each item is the instant at which the permit's tick fired. Streams can be
/// cloned and polled from many tasks at once; every permit is handed to
/// exactly one of them, in the order they became ready.
///
/// Permits taken from the stream are *not* counted against the window. Call
/// [`PacedLimiter::count`](crate::PacedLimiter::count) once per item, or the
/// limiter will overstate what remains until the next reset.
///
/// The stream ends once the limiter stops.
#[derive(Debug)]
pub struct Permits {
    waiters: mpsc::UnboundedSender<Waiter>,
    pending: Option<oneshot::Receiver<Instant>>,
    terminated: bool,
}

impl Permits {
    pub(crate) fn new(waiters: mpsc::UnboundedSender<Waiter>) -> Self {
        Self {
            waiters,
            pending: None,
            terminated: false,
        }
    }
}

// A clone queues independently of the original.
impl Clone for Permits {
    fn clone(&self) -> Self {
        Self::new(self.waiters.clone())
    }
}

impl Stream for Permits {
    type Item = Instant;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }

        let mut permit = match this.pending.take() {
            Some(permit) => permit,
            None => match request(&this.waiters, false) {
                Ok(permit) => permit,
                Err(_) => {
                    this.terminated = true;
                    return Poll::Ready(None);
                }
            },
        };

        match Pin::new(&mut permit).poll(cx) {
            Poll::Ready(Ok(fired_at)) => Poll::Ready(Some(fired_at)),
            Poll::Ready(Err(_)) => {
                this.terminated = true;
                Poll::Ready(None)
            }
            Poll::Pending => {
                this.pending = Some(permit);
                Poll::Pending
            }
        }
    }
}

impl FusedStream for Permits {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl Drop for Permits {
    fn drop(&mut self) {
        // Stream items are never counted, so an unread one leaves the window
        // as it was.
        if let Some(mut permit) = self.pending.take() {
            permit.close();
            if let Ok(fired_at) = permit.try_recv() {
                trace!(?fired_at, "stream dropped with an unread permit");
            }
        }
    }
}
