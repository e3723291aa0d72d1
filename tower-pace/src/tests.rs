use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use more_asserts::assert_ge;
use pace_limit::PacedLimiter;
use tokio::time::Instant;
use tokio::time::sleep;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;

use super::*;

use futures::future::Ready;
use futures::future::ready;

#[derive(Clone, Debug, Default)]
struct MockService {
    pub count: Arc<AtomicUsize>,
}

impl Service<()> for MockService {
    type Response = ();
    type Error = BoxError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ()) -> Self::Future {
        self.count.fetch_add(1, Ordering::SeqCst);
        ready(Ok(()))
    }
}

fn limiter(tick_ms: u64, limit: usize, reset: Duration) -> Arc<PacedLimiter> {
    Arc::new(PacedLimiter::new(Duration::from_millis(tick_ms), limit, reset).unwrap())
}

fn pace_error(err: BoxError) -> PaceError {
    err.downcast_ref::<PaceError>()
        .cloned()
        .unwrap_or_else(|| panic!("expected a PaceError, got {err}"))
}

#[tokio::test(start_paused = true)]
async fn test_poll_ready_waits_for_permit() {
    let start = Instant::now();
    let limiter = limiter(100, 2, Duration::from_secs(10));
    let mock = MockService::default();
    let mut service = PacedService::new(mock.clone(), limiter.clone());

    // Nothing is issued before the first tick
    assert!(futures::poll!(ServiceExt::<()>::ready(&mut service)).is_pending());

    ServiceExt::<()>::ready(&mut service).await.unwrap();
    service.call(()).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_millis(100));

    ServiceExt::<()>::ready(&mut service).await.unwrap();
    service.call(()).await.unwrap();
    assert_eq!(limiter.remaining(), 0);

    // The window is spent, so this poll must stay Pending
    tokio::select! {
        _ = ServiceExt::<()>::ready(&mut service) => panic!("Should be throttled!"),
        _ = sleep(Duration::from_millis(500)) => {}
    }

    // The permit we queued for arrives once the window resets
    ServiceExt::<()>::ready(&mut service)
        .await
        .expect("Should recover");
    service.call(()).await.unwrap();
    assert_ge!(start.elapsed(), Duration::from_secs(10));
    assert_eq!(mock.count.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_layer_integration() {
    let mock = MockService::default();
    let mut service = ServiceBuilder::new()
        .paced(limiter(10, 100, Duration::from_secs(1)))
        .service(mock.clone());

    // Verify it handles a basic request
    service.ready().await.unwrap().call(()).await.unwrap();
    assert_eq!(mock.count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shared_limiter_across_clones() {
    let layer = PacedLayer::new(limiter(10, 1, Duration::from_secs(10)));

    let mut svc1 = layer.layer(MockService::default());
    let mut svc2 = layer.layer(MockService::default());

    svc1.ready().await.unwrap().call(()).await.unwrap();

    // svc2 should now be throttled because svc1 used the window
    sleep(Duration::from_millis(100)).await;
    assert!(futures::poll!(ServiceExt::<()>::ready(&mut svc2)).is_pending());
}

#[tokio::test(start_paused = true)]
async fn test_permit_wait_timeout() {
    let shared = limiter(100, 5, Duration::from_secs(1));
    let mut service = ServiceBuilder::new()
        .paced_with_timeout(shared.clone(), Duration::from_millis(50))
        .service(MockService::default());

    let err = ServiceExt::<()>::ready(&mut service).await.unwrap_err();
    assert!(matches!(pace_error(err), PaceError::Timeout));
    assert_eq!(shared.remaining(), 5);

    // A fresh wait is started after a timeout
    let mut service = ServiceBuilder::new()
        .paced_with_timeout(
            limiter(100, 5, Duration::from_secs(1)),
            Duration::from_millis(150),
        )
        .service(MockService::default());
    service.ready().await.unwrap().call(()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stopped_limiter() {
    let limiter = limiter(10, 5, Duration::from_secs(1));
    let mut service = PacedService::new(MockService::default(), limiter.clone());

    limiter.stop();
    let err = ServiceExt::<()>::ready(&mut service).await.unwrap_err();
    assert!(matches!(pace_error(err), PaceError::Stopped));
}

#[tokio::test(start_paused = true)]
async fn test_stop_releases_waiting_service() {
    let limiter = limiter(10, 1, Duration::from_secs(3600));
    let mut service = PacedService::new(MockService::default(), limiter.clone());

    service.ready().await.unwrap().call(()).await.unwrap();

    let waiting = tokio::spawn(async move {
        ServiceExt::<()>::ready(&mut service).await.map(|_| ())
    });
    sleep(Duration::from_millis(50)).await;
    limiter.stop();

    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(pace_error(err), PaceError::Stopped));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_service_returns_unread_permit() {
    let limiter = limiter(100, 5, Duration::from_secs(1));
    let mut service = PacedService::new(MockService::default(), limiter.clone());

    // The service is handed the 100ms permit but goes away before reading it.
    assert!(futures::poll!(ServiceExt::<()>::ready(&mut service)).is_pending());
    sleep(Duration::from_millis(150)).await;
    assert_eq!(limiter.remaining(), 4);

    drop(service);
    assert_eq!(limiter.remaining(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_managed_layer_cloning_concurrency() {
    let capacity = 5;
    // One permit every 10ms, and the window does not reset within the test
    let limiter = limiter(10, capacity, Duration::from_secs(60));

    // Create the Managed Layer (Wait up to 100ms before failing)
    let layer = ManagedPacedLayer::new(limiter, Duration::from_millis(100));

    let mock = MockService::default();
    let service = ServiceBuilder::new().layer(layer).service(mock.clone());

    let mut handles = vec![];

    // Fire 20 requests from 20 different clones
    for _ in 0..20 {
        let mut cloned_svc = service.clone();
        handles.push(tokio::spawn(async move {
            let ready_svc = cloned_svc.ready().await?;
            ready_svc.call(()).await
        }));
    }

    let mut success = 0;
    let mut timeouts = 0;

    for h in handles {
        match h.await.unwrap() {
            Ok(_) => success += 1,
            Err(err) => {
                assert!(matches!(pace_error(err), PaceError::Timeout));
                timeouts += 1;
            }
        }
    }

    // ASSERTIONS
    assert_eq!(success, capacity, "Should have exactly 5 successes");
    assert_eq!(timeouts, 15, "Remaining 15 should have timed out");
    assert_eq!(
        mock.count.load(Ordering::SeqCst),
        capacity,
        "Inner service should only see 5 hits"
    );
}

#[test]
fn test_limiter_error_mapping() {
    assert!(matches!(
        PaceError::from(pace_limit::LimiterError::Stopped),
        PaceError::Stopped
    ));
    assert!(matches!(
        PaceError::from(pace_limit::LimiterError::Overcount),
        PaceError::Inner(_)
    ));
}
