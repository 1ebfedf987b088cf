// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session lifecycle and resilience engine.
//!
//! The [`SessionEngine`] owns the in-memory state of every instance, drives
//! each one through the connection state machine, runs the liveness probes,
//! reconnects with backoff after arbitrary failures, and enforces the
//! send-or-enqueue contract for outbound messages. It reconciles three
//! authorities under concurrent failure: the durable intent table, the
//! volatile registry, and the opaque browser-backed client behind the
//! adapter seam.

pub mod lifecycle;
pub mod liveness;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub mod rehydrate;
pub mod shutdown;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use zapgate_config::{DaemonConfig, EngineConfig};
use zapgate_core::{
    BlobStore, ClientFactory, DisconnectReason, InstanceStatus, MessageKind, MetadataStore,
    PendingMessage, SendOutcome, ZapgateError,
};

pub use queue::PendingQueues;
pub use registry::{SessionRegistry, SessionSnapshot, SessionState};

/// The engine: registry, queues, probes, reconnector, and their shared seams.
pub struct SessionEngine {
    pub(crate) registry: SessionRegistry,
    pub(crate) queues: PendingQueues,
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) factory: Arc<dyn ClientFactory>,
    pub(crate) policy: EngineConfig,
    pub(crate) daemon: DaemonConfig,
    /// Directory where the adapter stages auth archives before `save`.
    pub(crate) staging_dir: std::path::PathBuf,
    /// One in-flight reconnect per instance id.
    pub(crate) reconnects: DashMap<String, ()>,
    /// One in-flight start per instance id; a racing second start is a no-op.
    pub(crate) starts: DashMap<String, ()>,
    /// Global shutdown token; probe groups are children of it.
    pub(crate) shutdown: CancellationToken,
}

impl SessionEngine {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        factory: Arc<dyn ClientFactory>,
        policy: EngineConfig,
        daemon: DaemonConfig,
        staging_dir: impl Into<std::path::PathBuf>,
    ) -> Arc<Self> {
        let queues = PendingQueues::new(policy.queue_capacity, policy.message_ttl());
        Arc::new(Self {
            registry: SessionRegistry::new(),
            queues,
            store,
            blobs,
            factory,
            policy,
            daemon,
            staging_dir: staging_dir.into(),
            reconnects: DashMap::new(),
            starts: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// The metadata store the engine persists through.
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// The auth blob store.
    pub fn blobs(&self) -> Arc<dyn BlobStore> {
        self.blobs.clone()
    }

    /// The engine policy in effect.
    pub fn policy(&self) -> &EngineConfig {
        &self.policy
    }

    /// Session-blob key for an instance.
    pub fn blob_name(instance_id: &str) -> String {
        format!("RemoteAuth-{instance_id}")
    }

    /// Current status plus QR availability for one instance, if registered.
    pub async fn status_of(&self, id: &str) -> Option<(InstanceStatus, bool)> {
        let cell = self.registry.get(id)?;
        let state = cell.lock().await;
        Some((state.status, state.qr.is_some()))
    }

    /// Current QR payload for one instance, if pairing.
    pub async fn current_qr(&self, id: &str) -> Option<String> {
        let cell = self.registry.get(id)?;
        let state = cell.lock().await;
        state.qr.clone()
    }

    /// Pending queue contents for one instance.
    pub fn queue_snapshot(&self, id: &str) -> Vec<PendingMessage> {
        self.queues.snapshot(id)
    }

    /// Drop every queued message for one instance; returns the count dropped.
    pub fn clear_queue(&self, id: &str) -> usize {
        self.queues.clear(id)
    }

    /// Send through the live client, or enqueue and trigger recovery when the
    /// instance is not CONNECTED.
    pub async fn send_or_enqueue(
        self: &Arc<Self>,
        id: &str,
        message: PendingMessage,
    ) -> Result<SendOutcome, ZapgateError> {
        if let Some(cell) = self.registry.get(id) {
            let (status, client) = {
                let state = cell.lock().await;
                (state.status, state.client.clone())
            };

            if status == InstanceStatus::Connected {
                if let Some(client) = client {
                    let result = match message.kind {
                        MessageKind::Text => {
                            client.send_text(&message.to, &message.content).await
                        }
                        MessageKind::Media => {
                            let media = message.media.clone().unwrap_or_default();
                            client
                                .send_media(&message.to, &media, message.caption.as_deref())
                                .await
                        }
                    };

                    match result {
                        Ok(wire_id) => {
                            cell.lock().await.last_activity = std::time::Instant::now();
                            return Ok(SendOutcome::Sent { message_id: wire_id });
                        }
                        Err(e) if e.indicates_disconnect() => {
                            warn!(
                                instance_id = id,
                                error = %e,
                                "send failed, instance looks disconnected; queueing"
                            );
                            let message_id = message.id.clone();
                            let position = self.queues.enqueue(id, message);
                            self.schedule_reconnect(id, DisconnectReason::NetworkError);
                            return Ok(SendOutcome::Queued { message_id, position });
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let message_id = message.id.clone();
        let position = self.queues.enqueue(id, message);
        debug!(instance_id = id, position, "message queued, instance not connected");
        self.ensure_running(id).await;
        Ok(SendOutcome::Queued { message_id, position })
    }

    /// Make sure an instance with queued work is moving towards CONNECTED.
    ///
    /// A missing session is started (when intent allows); a terminal session
    /// is reconnected; anything in flight is left alone.
    pub(crate) async fn ensure_running(self: &Arc<Self>, id: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }

        match self.registry.get(id) {
            None => {
                if self.reconnects.contains_key(id) {
                    return;
                }
                let enabled = match self.store.get_instance(id).await {
                    Ok(Some(record)) => record.enabled,
                    Ok(None) => true,
                    Err(e) => {
                        warn!(instance_id = id, error = %e, "intent lookup failed, assuming enabled");
                        true
                    }
                };
                if !enabled {
                    debug!(instance_id = id, "instance disabled, leaving messages queued");
                    return;
                }
                if let Err(e) = self.start_instance(id).await {
                    warn!(instance_id = id, error = %e, "start for queued send failed");
                }
            }
            Some(cell) => {
                let (status, reconnecting) = {
                    let state = cell.lock().await;
                    (state.status, state.reconnecting)
                };
                if status.is_terminal() && !reconnecting {
                    self.schedule_reconnect(id, DisconnectReason::Manual);
                }
            }
        }
    }

    /// Full health snapshot for the health endpoint.
    pub async fn health(&self) -> EngineHealth {
        let queue_sizes = self.queues.sizes();
        let mut instances = Vec::new();
        let mut totals: HashMap<String, usize> = HashMap::new();

        for snap in self.registry.snapshot().await {
            *totals.entry(snap.status.as_db_str().to_string()).or_default() += 1;
            let queue_size = queue_sizes.get(&snap.instance_id).copied().unwrap_or(0);
            instances.push(InstanceHealth {
                id: snap.instance_id.clone(),
                status: snap.status.to_string(),
                has_qr: snap.has_qr,
                phone: snap.phone,
                reconnect_attempts: snap.reconnect_attempts,
                consecutive_ping_failures: snap.consecutive_ping_failures,
                reconnecting: snap.reconnecting,
                degraded: snap.degraded,
                queue_size,
                last_ping_secs_ago: snap.last_ping_ok.elapsed().as_secs(),
                last_activity_secs_ago: snap.last_activity.elapsed().as_secs(),
                connected_secs: snap.connected_at.map(|t| t.elapsed().as_secs()),
                last_disconnect_reason: snap.last_disconnect_reason,
            });
        }
        instances.sort_by(|a, b| a.id.cmp(&b.id));

        EngineHealth {
            instances,
            totals,
            memory: liveness::sample_memory(),
        }
    }

    /// Race an external call against a timeout; the timeout is treated as a
    /// failure and fed into the same pipeline.
    pub(crate) async fn with_timeout<T>(
        duration: Duration,
        fut: impl std::future::Future<Output = Result<T, ZapgateError>>,
    ) -> Result<T, ZapgateError> {
        match tokio::time::timeout(duration, fut).await {
            Ok(result) => result,
            Err(_) => Err(ZapgateError::Timeout { duration }),
        }
    }
}

/// Health report for the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub instances: Vec<InstanceHealth>,
    /// Session counts keyed by status string.
    pub totals: HashMap<String, usize>,
    pub memory: MemorySnapshot,
}

/// Health report for one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub id: String,
    pub status: String,
    pub has_qr: bool,
    pub phone: Option<String>,
    pub reconnect_attempts: u32,
    pub consecutive_ping_failures: u32,
    pub reconnecting: bool,
    pub degraded: bool,
    pub queue_size: usize,
    pub last_ping_secs_ago: u64,
    pub last_activity_secs_ago: u64,
    pub connected_secs: Option<u64>,
    pub last_disconnect_reason: Option<String>,
}

/// Process memory sample from the allocator and the kernel.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemorySnapshot {
    pub allocated_bytes: u64,
    pub resident_bytes: u64,
    pub rss_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_name_is_prefixed() {
        assert_eq!(SessionEngine::blob_name("abc"), "RemoteAuth-abc");
    }

    #[tokio::test]
    async fn with_timeout_passes_through_success() {
        let out = SessionEngine::with_timeout(Duration::from_secs(1), async {
            Ok::<_, ZapgateError>(42)
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn with_timeout_converts_elapsed_to_timeout_error() {
        let result: Result<(), _> =
            SessionEngine::with_timeout(Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        match result {
            Err(ZapgateError::Timeout { duration }) => {
                assert_eq!(duration, Duration::from_millis(10));
            }
            other => panic!("expected timeout error, got {other:?}"),
        }
    }
}
