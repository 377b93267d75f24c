//! udp-counter demo driver
//!
//! Spawns a pool of workers that each report an increment, then prints the
//! aggregate:
//! - `udp` mode: workers are clients of a counter server bound in this process
//! - `local` mode: workers return partial counters that are merged here
//!
//! Configuration via CLI arguments or TOML file.

use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use udp_counter::config::{Config, DemoMode};
use udp_counter::{Counter, CounterClient, CounterServer, LocalCounter};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        endpoint = %config.endpoint,
        mode = ?config.mode,
        workers = config.workers,
        increment = config.increment,
        poll_timeout_ms = config.listener.poll_timeout.as_millis() as u64,
        "Starting udp-counter"
    );

    let value = match config.mode {
        DemoMode::Udp => run_udp(&config)?,
        DemoMode::Local => run_local(&config)?,
    };

    println!("{value}");
    Ok(())
}

/// Aggregate through a counter server; workers are fire-and-forget clients.
fn run_udp(config: &Config) -> Result<i64, Box<dyn std::error::Error>> {
    let server = CounterServer::with_options(config.endpoint, config.listener)?;
    let endpoint = server.local_endpoint();
    let increment = config.increment;

    let handles = spawn_workers(config.workers, move |worker_id| {
        let counter = CounterClient::new(endpoint);
        counter.increase(increment)?;
        info!(worker = worker_id, "Worker reported its increment");
        Ok(())
    })?;

    for (worker_id, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(worker = worker_id, error = %e, "Worker failed to report"),
            Err(_) => error!(worker = worker_id, "Worker panicked"),
        }
    }

    // Delivery is unacknowledged; give the listener time to drain.
    thread::sleep(config.settle);

    let value = server.value();
    let stats = server.stats();
    info!(
        value,
        applied = stats.applied,
        rejected = stats.rejected,
        "Aggregate read"
    );

    server.close();
    Ok(value)
}

/// Aggregate in-process by merging per-worker partial counters.
fn run_local(config: &Config) -> Result<i64, Box<dyn std::error::Error>> {
    let increment = config.increment;

    let handles = spawn_workers(config.workers, move |worker_id| {
        let mut counter = LocalCounter::new();
        counter.increase(increment);
        info!(worker = worker_id, "Worker finished");
        Ok(counter)
    })?;

    let mut total = LocalCounter::new();
    for (worker_id, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(partial)) => total = LocalCounter::merge(total, partial),
            Ok(Err(e)) => warn!(worker = worker_id, error = %e, "Worker failed"),
            Err(_) => error!(worker = worker_id, "Worker panicked"),
        }
    }

    info!(value = total.value(), "Aggregate merged");
    Ok(total.value())
}

fn spawn_workers<T, F>(
    count: usize,
    work: F,
) -> std::io::Result<Vec<JoinHandle<udp_counter::Result<T>>>>
where
    T: Send + 'static,
    F: Fn(usize) -> udp_counter::Result<T> + Send + Clone + 'static,
{
    (0..count)
        .map(|worker_id| {
            let work = work.clone();
            thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || work(worker_id))
        })
        .collect()
}
