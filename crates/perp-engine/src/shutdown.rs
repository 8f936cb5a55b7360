//! Shutdown coordinator.
//!
//! Captures SIGINT/SIGTERM, then tears the process down in order: admin
//! HTTP first, feed second, runners last. Each stage runs under a hard
//! ceiling so a misbehaving exchange cannot prevent termination.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::feed::FeedStopHandle;
use crate::supervisor::Supervisor;

/// Ceiling for the admin HTTP server to drain.
pub const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Ceiling for all in-flight strategy work to drain.
pub const STOP_ALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Resolves on SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

pub struct ShutdownCoordinator {
    pub http_stop: broadcast::Sender<()>,
    pub http_task: JoinHandle<()>,
    pub feed_stop: FeedStopHandle,
    pub feed_task: JoinHandle<()>,
    pub supervisor: Arc<Supervisor>,
}

impl ShutdownCoordinator {
    /// Block until a termination signal, then run the staged teardown.
    pub async fn run(self) {
        wait_for_signal().await;
        info!(pid = std::process::id(), "terminating");

        // 1. Admin surface stops accepting control requests.
        let _ = self.http_stop.send(());
        if tokio::time::timeout(HTTP_SHUTDOWN_TIMEOUT, self.http_task)
            .await
            .is_err()
        {
            warn!("admin server did not shut down within the ceiling");
        }

        // 2. Close the feed so no new marks enter the system.
        self.feed_stop.stop();
        let _ = self.feed_task.await;

        // 3. Drain every runner and the event loop.
        if tokio::time::timeout(STOP_ALL_TIMEOUT, self.supervisor.stop_all())
            .await
            .is_err()
        {
            warn!(
                "in-flight strategy work did not drain within {}s",
                STOP_ALL_TIMEOUT.as_secs()
            );
        }

        info!(pid = std::process::id(), "terminated");
    }
}
