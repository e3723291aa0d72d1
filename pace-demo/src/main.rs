use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use futures::StreamExt;
use hdrhistogram::Histogram;
use pace_limit::PacedLimiter;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio::time::sleep;
use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tower::service_fn;
use tower_pace::ServiceBuilderExt;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Consume paced permits in a few different ways.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Spacing between permits
    #[arg(long, global = true, default_value = "250ms", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Permits allowed per window
    #[arg(long, global = true, default_value_t = 5)]
    limit: usize,

    /// Window length
    #[arg(long, global = true, default_value = "3s", value_parser = humantime::parse_duration)]
    reset: Duration,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// One caller looping on `wait()`
    Blocking {
        #[arg(long, default_value_t = 15)]
        calls: usize,
    },
    /// Several tasks sharing the limiter through `wait()`
    Workers {
        #[arg(long, default_value_t = 6)]
        workers: usize,
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        run_for: Duration,
    },
    /// Several tasks reading the raw permit stream and counting by hand
    Stream {
        #[arg(long, default_value_t = 6)]
        workers: usize,
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        run_for: Duration,
    },
    /// Requests sent through a paced tower service
    Service {
        #[arg(long, default_value_t = 15)]
        requests: usize,
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
}

fn new_histogram() -> Result<Histogram<u64>, BoxError> {
    Ok(Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3)?)
}

async fn run_blocking(limiter: Arc<PacedLimiter>, calls: usize) -> Result<Histogram<u64>, BoxError> {
    let mut waits = new_histogram()?;

    for call in 0..calls {
        let started = Instant::now();
        match limiter.wait().await {
            Ok(_) => {
                let waited = started.elapsed();
                waits.saturating_record(waited.as_micros() as u64);
                info!(call, ?waited, remaining = limiter.remaining(), "expensive call allowed");
            }
            Err(err) => {
                warn!(%err, "limiter stopped");
                break;
            }
        }
    }

    limiter.stop();
    Ok(waits)
}

async fn run_workers(
    limiter: Arc<PacedLimiter>,
    workers: usize,
    run_for: Duration,
) -> Result<Histogram<u64>, BoxError> {
    let mut tasks = JoinSet::new();

    for worker in 0..workers {
        let limiter = Arc::clone(&limiter);
        let mut waits = new_histogram()?;
        tasks.spawn(async move {
            loop {
                let started = Instant::now();
                if let Err(err) = limiter.wait().await {
                    info!(worker, %err, "worker closing");
                    break;
                }
                waits.saturating_record(started.elapsed().as_micros() as u64);
                info!(worker, remaining = limiter.remaining(), "permit");
            }
            waits
        });
    }

    sleep(run_for).await;
    limiter.stop();
    collect(tasks).await
}

async fn run_stream(
    limiter: Arc<PacedLimiter>,
    workers: usize,
    run_for: Duration,
) -> Result<Histogram<u64>, BoxError> {
    let mut tasks = JoinSet::new();

    for worker in 0..workers {
        let limiter = Arc::clone(&limiter);
        let mut permits = limiter.permits();
        let mut waits = new_histogram()?;
        tasks.spawn(async move {
            let mut started = Instant::now();
            while let Some(fired_at) = permits.next().await {
                // Stream consumers do their own accounting.
                if let Err(err) = limiter.count() {
                    warn!(worker, %err, "permit not counted");
                }
                waits.saturating_record(started.elapsed().as_micros() as u64);
                info!(worker, ?fired_at, remaining = limiter.remaining(), "permit");
                started = Instant::now();
            }
            info!(worker, "worker closing");
            waits
        });
    }

    sleep(run_for).await;
    limiter.stop();
    collect(tasks).await
}

async fn run_service(
    limiter: Arc<PacedLimiter>,
    requests: usize,
    timeout: Duration,
) -> Result<Histogram<u64>, BoxError> {
    let mut waits = new_histogram()?;
    let mut svc = ServiceBuilder::new()
        .paced_with_timeout(Arc::clone(&limiter), timeout)
        .service(service_fn(|request: usize| async move {
            Ok::<_, BoxError>(request)
        }));

    for request in 0..requests {
        let started = Instant::now();
        match ServiceExt::<usize>::ready(&mut svc).await {
            Ok(ready) => {
                let response = ready.call(request).await?;
                waits.saturating_record(started.elapsed().as_micros() as u64);
                info!(response, remaining = limiter.remaining(), "request served");
            }
            Err(err) => {
                warn!(request, %err, "request rejected");
            }
        }
    }

    limiter.stop();
    Ok(waits)
}

async fn collect(mut tasks: JoinSet<Histogram<u64>>) -> Result<Histogram<u64>, BoxError> {
    let mut waits = new_histogram()?;
    while let Some(task) = tasks.join_next().await {
        waits.add(task?)?;
    }
    Ok(waits)
}

fn report(name: &str, waits: &Histogram<u64>, total: Duration) {
    println!("--- {} ---", name);
    println!("Total Duration:  {:.2?}", total);
    println!("Permits:         {}", waits.len());
    if !waits.is_empty() {
        println!("P50 (Wait):      {}µs", waits.value_at_quantile(0.5));
        println!("P99 (Wait):      {}µs", waits.value_at_quantile(0.99));
        println!("Max (Wait):      {}µs", waits.max());
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let limiter = Arc::new(PacedLimiter::new(args.interval, args.limit, args.reset)?);
    info!(
        interval = ?args.interval,
        limit = args.limit,
        reset = ?args.reset,
        "limiter started"
    );

    let start = Instant::now();
    let (name, waits) = match args.mode {
        Mode::Blocking { calls } => ("Blocking", run_blocking(limiter, calls).await?),
        Mode::Workers { workers, run_for } => ("Workers", run_workers(limiter, workers, run_for).await?),
        Mode::Stream { workers, run_for } => ("Stream", run_stream(limiter, workers, run_for).await?),
        Mode::Service { requests, timeout } => ("Service", run_service(limiter, requests, timeout).await?),
    };
    report(name, &waits, start.elapsed());

    Ok(())
}
