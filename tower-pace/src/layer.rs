use std::sync::Arc;
use std::time::Duration;

use pace_limit::PacedLimiter;
use tower::Layer;

use crate::service::PacedService;

/// Paces requests with a shared [`PacedLimiter`].
#[derive(Debug, Clone)]
pub struct PacedLayer {
    limiter: Arc<PacedLimiter>,
    timeout: Option<Duration>,
}

impl PacedLayer {
    /// Create a PacedLayer
    pub fn new(limiter: Arc<PacedLimiter>) -> Self {
        PacedLayer {
            limiter,
            timeout: None,
        }
    }

    /// Set a unified timeout for both waiting for a permit and request execution.
    ///
    /// If the total time exceeds this duration, the service
    /// will return `PaceError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<S> Layer<S> for PacedLayer {
    type Service = PacedService<S>;

    fn layer(&self, service: S) -> Self::Service {
        let svc = PacedService::new(service, self.limiter.clone());
        match self.timeout {
            Some(timeout) => svc.with_timeout(timeout),
            None => svc,
        }
    }
}
