use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use pace_limit::PacedLimiter;
use pin_project_lite::pin_project;
use tokio::time::Instant;
use tokio::time::Timeout;
use tokio::time::timeout;
use tower::BoxError;
use tower::Service;
use tracing::trace;

use crate::error::PaceError;

// Must be Sync: the service is boxed into `BoxCloneSyncService`.
type PermitFuture = Pin<Box<dyn Future<Output = Result<Instant, PaceError>> + Send + Sync>>;

#[derive(Clone, Debug)]
struct PacedServiceMetrics {
    permits_acquired: Counter<u64>,
    permit_rejections: Counter<u64>,
    permit_wait: Histogram<f64>,
}

/// Holds each request back until the limiter issues it a permit.
pub struct PacedService<S> {
    inner: S,
    limiter: Arc<PacedLimiter>,
    pending: Option<PermitFuture>,
    permit: Option<Instant>,
    timeout: Option<Duration>,
    wait_start: Option<Instant>,
    instruments: PacedServiceMetrics,
}

pin_project! {
    /// A future that wraps the inner service future with a timeout.
    pub struct ResponseFuture<F> {
        #[pin]
        inner: Timeout<F>,
    }
}

impl<F, T, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, E>>,
    E: From<BoxError>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(E::from(Box::new(PaceError::Timeout)))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for PacedService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacedService")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .field("permit", &self.permit)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

// Manually implement Clone because the pending permit future cannot be cloned
impl<S> Clone for PacedService<S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            // A clone queues for its own permit
            pending: None,
            permit: None,
            timeout: self.timeout,
            wait_start: None,
            instruments: self.instruments.clone(),
        }
    }
}

impl<S, Req> Service<Req> for PacedService<S>
where
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Check inner service readiness FIRST so a permit is never held for a
        // service that cannot take the request.
        match self.inner.poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }

        if self.permit.is_some() {
            return Poll::Ready(Ok(()));
        }

        let mut pending = match self.pending.take() {
            Some(pending) => pending,
            None => {
                self.wait_start = Some(Instant::now());
                acquire(
                    Arc::clone(&self.limiter),
                    self.timeout,
                    self.instruments.permit_wait.clone(),
                )
            }
        };

        match pending.as_mut().poll(cx) {
            Poll::Ready(Ok(fired_at)) => {
                trace!(?fired_at, "permit acquired");
                self.instruments.permits_acquired.add(1, &[]);
                self.permit = Some(fired_at);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                let reason = match err {
                    PaceError::Timeout => "timeout",
                    PaceError::Stopped => "stopped",
                    PaceError::Inner(_) => "inner",
                };
                self.instruments
                    .permit_rejections
                    .add(1, &[KeyValue::new("reason", reason)]);
                self.wait_start = None;
                Poll::Ready(Err(Box::new(err)))
            }
            Poll::Pending => {
                self.pending = Some(pending);
                Poll::Pending
            }
        }
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.permit = None;
        let start = self.wait_start.take();
        let timeout_duration = match (self.timeout, start) {
            (Some(t), Some(s)) => t.saturating_sub(s.elapsed()),
            (Some(t), None) => t,
            (None, _) => Duration::from_secs(3600 * 24 * 365), // Effective infinity
        };

        ResponseFuture {
            inner: timeout(timeout_duration, self.inner.call(req)),
        }
    }
}

fn acquire(
    limiter: Arc<PacedLimiter>,
    max_wait: Option<Duration>,
    permit_wait: Histogram<f64>,
) -> PermitFuture {
    Box::pin(wait_for_permit(limiter, max_wait, permit_wait))
}

async fn wait_for_permit(
    limiter: Arc<PacedLimiter>,
    max_wait: Option<Duration>,
    permit_wait: Histogram<f64>,
) -> Result<Instant, PaceError> {
    let started = Instant::now();
    let permit = match max_wait {
        Some(max_wait) => timeout(max_wait, limiter.wait())
            .await
            .map_err(|_| PaceError::Timeout)?,
        None => limiter.wait().await,
    };
    permit_wait.record(started.elapsed().as_secs_f64(), &[]);
    Ok(permit?)
}

impl<S> PacedService<S> {
    pub fn new(inner: S, limiter: Arc<PacedLimiter>) -> Self {
        let meter = global::meter("paced_service");
        let instruments = PacedServiceMetrics {
            permits_acquired: meter.u64_counter("permits_acquired").build(),
            permit_rejections: meter.u64_counter("permit_rejections").build(),
            permit_wait: meter
                .f64_histogram("permit_wait_seconds")
                .with_unit("s")
                .build(),
        };

        Self {
            inner,
            limiter,
            pending: None,
            permit: None,
            timeout: None,
            wait_start: None,
            instruments,
        }
    }

    /// Bound the combined time spent waiting for a permit and in the inner
    /// service.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
