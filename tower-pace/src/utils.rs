use std::sync::Arc;
use std::time::Duration;

use pace_limit::PacedLimiter;
use tower::ServiceBuilder;
use tower::layer::util::Stack;

use crate::PacedLayer;

/// Service Builder Extension with additional useful functions for tower::ServiceBuilder.
pub trait ServiceBuilderExt<L> {
    /// Wait for a permit before every request
    fn paced(self, limiter: Arc<PacedLimiter>) -> ServiceBuilder<Stack<PacedLayer, L>>;

    /// Wait for a permit before every request, failing if the permit and
    /// the response together take longer than `timeout`
    fn paced_with_timeout(
        self,
        limiter: Arc<PacedLimiter>,
        timeout: Duration,
    ) -> ServiceBuilder<Stack<PacedLayer, L>>;
}

impl<L> ServiceBuilderExt<L> for ServiceBuilder<L> {
    fn paced(self, limiter: Arc<PacedLimiter>) -> ServiceBuilder<Stack<PacedLayer, L>> {
        self.layer(PacedLayer::new(limiter))
    }

    fn paced_with_timeout(
        self,
        limiter: Arc<PacedLimiter>,
        timeout: Duration,
    ) -> ServiceBuilder<Stack<PacedLayer, L>> {
        self.layer(PacedLayer::new(limiter).with_timeout(timeout))
    }
}
