//! Graceful shutdown coordination.
//!
//! One [`CancellationToken`] is the shutdown broadcast: the HTTP server,
//! every job poller (via child tokens), and the periodic engine loops all
//! watch it. In-flight work is counted with RAII guards so shutdown can
//! drain outstanding network calls before the process exits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Coordinates shutdown across the engine's tasks.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    /// Maximum seconds to wait for in-flight work after the signal.
    drain_timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout_secs: u64) -> Self {
        Self {
            token: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            drain_timeout_secs,
        }
    }

    /// Clone of the broadcast token. Pollers derive child tokens from it so
    /// cancelling one job never touches the rest.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Request shutdown.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Count a unit of in-flight work until the returned guard drops.
    pub fn track(&self) -> WorkGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        WorkGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait for in-flight work to drain, up to the configured timeout.
    /// Returns whether everything drained in time.
    pub async fn drain(&self) -> bool {
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_secs(self.drain_timeout_secs);
        loop {
            let remaining = self.in_flight();
            if remaining == 0 {
                info!("All in-flight work drained");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "Drain timeout expired, exiting anyway");
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
    }
}

/// RAII guard decrementing the in-flight counter on drop.
pub struct WorkGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolves when SIGTERM/SIGINT arrives or the token is cancelled
/// programmatically, then propagates the cancellation.
pub async fn shutdown_signal(coordinator: ShutdownCoordinator) {
    let token = coordinator.token();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Shutdown requested (SIGTERM)"),
            _ = sigint.recv() => info!("Shutdown requested (SIGINT)"),
            _ = token.cancelled() => info!("Shutdown requested programmatically"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown requested (Ctrl-C)"),
            _ = token.cancelled() => info!("Shutdown requested programmatically"),
        }
    }

    coordinator.trigger();
}
