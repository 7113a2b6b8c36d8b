//! Active stream accounting and graceful drain on shutdown.
//!
//! ```text
//! SIGINT/SIGTERM ─► begin_shutdown ─► lock gate ─► request shutdown ─► wait drained ─► unlock
//!                                                        │
//! axum::serve ◄── with_graceful_shutdown ◄───────────────┘
//!      │ returns once in-flight streams finish
//!      ▼
//!   finish ─► mark drained ─► lock gate (waits for the listener) ─► exit
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Process-wide count of bundle requests in progress.
#[derive(Debug, Clone, Default)]
pub struct StreamTracker {
    active: Arc<AtomicI64>,
}

impl StreamTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request until the returned guard is dropped.
    pub fn begin(&self) -> StreamGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        StreamGuard {
            active: self.active.clone(),
        }
    }

    pub fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }
}

/// Decrements the active count exactly once, on drop.
#[derive(Debug)]
pub struct StreamGuard {
    active: Arc<AtomicI64>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Coordinates signal-driven shutdown with the serving task.
#[derive(Debug, Clone)]
pub struct DrainController {
    gate: Arc<Mutex<()>>,
    shutdown: Arc<watch::Sender<bool>>,
    drained: Arc<watch::Sender<bool>>,
    streams: StreamTracker,
}

impl DrainController {
    pub fn new(streams: StreamTracker) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (drained, _) = watch::channel(false);
        Self {
            gate: Arc::new(Mutex::new(())),
            shutdown: Arc::new(shutdown),
            drained: Arc::new(drained),
            streams,
        }
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Ask the server to stop accepting connections and hold the gate until
    /// it reports that every connection has closed.
    pub async fn begin_shutdown(&self) {
        let _gate = self.gate.lock().await;
        tracing::info!(
            active_streams = self.streams.active(),
            "Shutting down server after receiving SIGINT or SIGTERM"
        );

        self.shutdown.send_replace(true);

        let mut drained = self.drained.subscribe();
        let _ = drained.wait_for(|done| *done).await;
        tracing::info!("All server connections closed, exiting");
    }

    /// Called by the serving task once the server has stopped.
    ///
    /// Waits for a shutdown in progress to release the gate.
    pub async fn finish(&self) {
        if self.is_shutting_down() {
            tracing::info!("No longer accepting new connections");
        } else {
            tracing::warn!("Server stopped without a shutdown request");
        }
        self.drained.send_replace(true);
        let _gate = self.gate.lock().await;
    }

    /// Run [`begin_shutdown`](Self::begin_shutdown) on the first
    /// SIGINT or SIGTERM.
    pub fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            controller.begin_shutdown().await;
        })
    }
}

/// Wait for SIGINT or SIGTERM (ctrl-c on non-unix targets).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Failed to listen for ctrl-c: {}", e);
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => tracing::debug!("Received SIGTERM"),
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!("Failed to listen for SIGINT: {}", e);
                }
                tracing::debug!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl-c: {}", e);
        }
    }
}
