//! SIGINT/SIGTERM handling.
//!
//! A signal only sets a flag. The pipeline checks it at stage boundaries up
//! to the first firewall mutation; after that the installation runs to the
//! end, so a signal never leaves the filter half-built by our own choice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Global flag indicating whether a shutdown has been requested.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Check if shutdown has been requested.
#[inline]
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

/// Request a shutdown (signal handler task, or tests).
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

/// Listens for SIGINT and SIGTERM for as long as the process runs.
pub struct ShutdownGuard {
    _marker: (),
}

impl ShutdownGuard {
    /// Spawn the listener task. Must be called inside a tokio runtime.
    ///
    /// If handlers cannot be registered the guard is still returned and
    /// signals keep their default behaviour.
    pub fn new() -> Self {
        tokio::spawn(async move {
            let sigint = signal(SignalKind::interrupt())
                .map_err(|e| warn!("Failed to register SIGINT handler: {}", e))
                .ok();
            let sigterm = signal(SignalKind::terminate())
                .map_err(|e| warn!("Failed to register SIGTERM handler: {}", e))
                .ok();

            match (sigint, sigterm) {
                (Some(mut int), Some(mut term)) => {
                    tokio::select! {
                        _ = int.recv() => info!("Received SIGINT, stopping before enforcement..."),
                        _ = term.recv() => info!("Received SIGTERM, stopping before enforcement..."),
                    }
                }
                (Some(mut int), None) => {
                    int.recv().await;
                    info!("Received SIGINT, stopping before enforcement...");
                }
                (None, Some(mut term)) => {
                    term.recv().await;
                    info!("Received SIGTERM, stopping before enforcement...");
                }
                (None, None) => {
                    warn!("No signal handlers registered - graceful shutdown disabled");
                    return;
                }
            }
            request_shutdown();
        });

        Self { _marker: () }
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation token handed to the pipeline.
///
/// Cancelled either explicitly or by the process-wide signal flag.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || is_shutdown_requested()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}
