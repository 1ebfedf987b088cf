// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shutdown coordination.
//!
//! A stop signal (SIGINT/SIGTERM, or ctrl-c off Unix) cancels the token the
//! serve loop watches. The engine-side shutdown then quiesces every
//! session, persists final status, and closes the metadata store, all
//! bounded by a hard deadline.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::SessionEngine;

impl SessionEngine {
    /// Wire process stop signals into a token the serve loop can watch.
    ///
    /// The returned token fires on the first signal. The engine's own
    /// token is cancelled later, by [`shutdown_gracefully`], so probes and
    /// in-flight reconnects keep gating sessions while the HTTP server
    /// drains.
    ///
    /// [`shutdown_gracefully`]: SessionEngine::shutdown_gracefully
    pub fn install_signal_handler(self: &Arc<Self>) -> CancellationToken {
        let stop = CancellationToken::new();
        let fired = stop.clone();
        let engine = self.clone();

        tokio::spawn(async move {
            let signal = wait_for_stop_signal().await;
            info!(
                signal,
                sessions = engine.registry.len(),
                "stop signal received, beginning drain"
            );
            fired.cancel();
        });

        stop
    }

    /// Quiesce every session, persist final status, and close the store.
    /// The whole procedure is bounded by the graceful-shutdown deadline;
    /// past it the caller force-exits.
    pub async fn shutdown_gracefully(self: &Arc<Self>) {
        let deadline = self.policy.graceful_shutdown();
        if tokio::time::timeout(deadline, self.shutdown_inner())
            .await
            .is_err()
        {
            error!(
                deadline_secs = deadline.as_secs(),
                "graceful shutdown deadline exceeded"
            );
        }
    }

    async fn shutdown_inner(self: &Arc<Self>) {
        info!(sessions = self.registry.len(), "shutting down");

        // Stops sweeps, probe groups (children), and pending reconnect sleeps.
        self.shutdown.cancel();

        for id in self.registry.ids() {
            let Some(cell) = self.registry.remove(&id) else {
                continue;
            };
            let client = {
                let mut state = cell.lock().await;
                state.shutting_down = true;
                state.cancel_probes();
                if let Some(task) = state.event_task.take() {
                    task.abort();
                }
                state.client.take()
            };

            if let Err(e) = self.store.update_status(&id, "DISCONNECTED", None).await {
                warn!(instance_id = id.as_str(), error = %e, "final status persist failed");
            }

            if let Some(client) = client {
                self.destroy_client(&id, client).await;
            }
            debug!(instance_id = id.as_str(), "session quiesced");
        }

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "metadata store close failed");
        }

        info!("shutdown complete");
    }
}

/// Resolve once the process receives a stop signal; returns its name for
/// the drain log line.
#[cfg(unix)]
async fn wait_for_stop_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            // No SIGTERM stream; ctrl-c alone still stops the process.
            warn!(error = %e, "SIGTERM handler unavailable, watching ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}
