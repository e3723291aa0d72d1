use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use pace_limit::PacedLimiter;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::util::BoxCloneSyncService;

use crate::PaceError;
use crate::PacedService;

/// A pre-composed pacing stack with a hard deadline.
///
/// Requests queue for a permit from the shared limiter. The whole process,
/// waiting for the permit plus the inner call, is bounded by `max_wait`.
///
/// ### Error Responsibilities:
/// - **Timeout (`PaceError::Timeout`)**: No permit arrived in time, or the
///   inner service was too slow to respond.
/// - **Stopped (`PaceError::Stopped`)**: The limiter was stopped and will
///   never issue another permit.
/// - **Inner (`PaceError::Inner`)**: Anything the inner service returned.
pub struct ManagedPacedLayer<Req> {
    limiter: Arc<PacedLimiter>,
    max_wait: Duration,
    _phantom: PhantomData<fn(Req)>,
}

// Note: Deriving Clone causes issues when using the layer with Axum.
// We'll just implemented it explicitly.
impl<Req> Clone for ManagedPacedLayer<Req> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            max_wait: self.max_wait,
            _phantom: PhantomData,
        }
    }
}

impl<S, Req> Layer<S> for ManagedPacedLayer<Req>
where
    S: Service<Req, Error = BoxError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Response: 'static,
    Req: Send + 'static,
{
    type Service = BoxCloneSyncService<Req, S::Response, BoxError>;

    fn layer(&self, inner: S) -> Self::Service {
        // The deadline covers the wait in poll_ready as well as the call.
        let paced = PacedService::new(inner, self.limiter.clone()).with_timeout(self.max_wait);

        // Map the mixed errors into PaceError
        let svc = tower::util::MapErr::new(paced, |err: BoxError| {
            if err.is::<PaceError>() {
                err
            } else {
                // Wrap any other inner service errors
                Box::from(PaceError::Inner(err.to_string()))
            }
        });

        BoxCloneSyncService::new(svc)
    }
}

impl<Req> ManagedPacedLayer<Req> {
    pub fn new(limiter: Arc<PacedLimiter>, max_wait: Duration) -> Self {
        Self {
            limiter,
            max_wait,
            _phantom: PhantomData,
        }
    }
}
