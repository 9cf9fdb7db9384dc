// --- Module Declarations & Re-exports ---
pub mod error;
pub use error::{CoreError, CooldownClass, RelayError};
pub mod scheduler;
pub use scheduler::{Processor, ProcessorGuard, Scheduler, TaskHandle};
pub mod status;
pub use status::{run_status_writer, StatusSink};
pub mod logging;
pub use logging::{StatusFile, STATUS_FILE_NAME};
pub mod connectivity;
pub use connectivity::{ConnectivityFlag, ConnectivityMonitor};
pub mod relay;
pub use relay::{RelayTask, RequestPayload};
pub mod audio;
pub use audio::{AudioSampler, AudioTask};
pub mod motion;
pub use motion::MotionTask;

use std::time::Duration;
use tokio::sync::watch;

// --- Crate-wide Result Type ---
pub type Result<T> = std::result::Result<T, CoreError>;

/// Resolves once shutdown has been requested, or the shutdown sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Timed delay that ends early on shutdown. Returns true if shutdown was requested.
pub(crate) async fn sleep_or_shutdown(duration: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = wait_for_shutdown(shutdown_rx) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_ends_early_on_shutdown() {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            shutdown_tx.send(true).expect("shutdown");
            shutdown_tx
        });

        let start = tokio::time::Instant::now();
        assert!(sleep_or_shutdown(Duration::from_secs(60), &mut shutdown_rx).await);
        assert!(start.elapsed() < Duration::from_secs(1));
        let _ = stopper.await;
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_runs_to_completion_without_shutdown() {
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        assert!(!sleep_or_shutdown(Duration::from_millis(250), &mut shutdown_rx).await);
    }
}
