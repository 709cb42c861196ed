use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Notify, time::Instant};

/// Calls `runnable.run_once()` every `interval`, measured from the start of
/// one run to the start of the next, until `shutdown` is notified.
///
/// Shutdown uses `notify_one`, so a signal sent while a run is in flight is
/// kept and observed at the next wait.
pub(crate) async fn run_at_fixed_interval<T: PeriodicRunnable>(
    runnable: Arc<T>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    let mut last_loop_time = Instant::now();
    loop {
        let mut shutdown_signal = false;
        tokio::select! {
            _ = shutdown.notified() => { shutdown_signal = true }
            _ = runnable.run_once() => {}
        }

        if !shutdown_signal && Instant::now() - last_loop_time < interval {
            tokio::select! {
                _ = shutdown.notified() => { shutdown_signal = true }
                _ = tokio::time::sleep_until(last_loop_time + interval) => {}
            }
        }
        last_loop_time = Instant::now();

        if shutdown_signal {
            break;
        }
    }

    runnable.before_shutdown_complete().await;
}

#[async_trait]
pub(crate) trait PeriodicRunnable: Send + Sync {
    async fn run_once(&self);
    async fn before_shutdown_complete(&self) {}
}
