// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serialised per-instance reconnect pipeline.
//!
//! One in-flight reconnect per instance: teardown, backoff delay, fresh
//! start. Immediate-class reasons take a short linear delay; everything else
//! backs off exponentially with jitter up to the ceiling. The attempt
//! counter wraps at the cap instead of giving up; only permanent reasons
//! disable an instance.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use rand::Rng;
use tracing::{debug, error, info, warn};

use zapgate_config::EngineConfig;
use zapgate_core::DisconnectReason;

use crate::SessionEngine;

/// Deterministic part of the backoff curve (no jitter).
pub fn compute_backoff(reason: &DisconnectReason, attempts: u32, policy: &EngineConfig) -> Duration {
    if reason.is_immediate() {
        return policy.immediate_base()
            + Duration::from_millis(u64::from(attempts) * policy.immediate_step_ms);
    }
    let base = policy.base_delay_ms as f64;
    let exp = base * 1.5_f64.powi(attempts.min(64) as i32);
    Duration::from_millis(exp.min(policy.max_delay_ms as f64) as u64)
}

/// Full delay: backoff plus uniform jitter for non-immediate reasons.
pub fn compute_delay(reason: &DisconnectReason, attempts: u32, policy: &EngineConfig) -> Duration {
    let backoff = compute_backoff(reason, attempts, policy);
    if reason.is_immediate() || policy.jitter_max_ms == 0 {
        return backoff;
    }
    let jitter = rand::thread_rng().gen_range(0..=policy.jitter_max_ms);
    backoff + Duration::from_millis(jitter)
}

impl SessionEngine {
    /// Queue a reconnect for `id`. A second request while one is in flight
    /// is dropped; a fresh disconnect after completion schedules anew.
    pub fn schedule_reconnect(self: &Arc<Self>, id: &str, reason: DisconnectReason) {
        if self.shutdown.is_cancelled() {
            return;
        }

        match self.reconnects.entry(id.to_string()) {
            Entry::Occupied(_) => {
                debug!(instance_id = id, "reconnect already in flight, dropped");
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let engine = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            engine.run_reconnect(&id, reason).await;
            engine.reconnects.remove(&id);
        });
    }

    async fn run_reconnect(self: &Arc<Self>, id: &str, reason: DisconnectReason) {
        // Intent gate: the durable row decides whether this instance comes
        // back at all. Database failure means reconnects proceed.
        let record = match self.store.get_instance(id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(instance_id = id, error = %e, "intent lookup failed, proceeding with reconnect");
                None
            }
        };
        let enabled = record.as_ref().map(|r| r.enabled).unwrap_or(true);
        let persisted_attempts = record.as_ref().map(|r| r.reconnect_attempts).unwrap_or(0);

        if reason.is_permanent() {
            error!(instance_id = id, reason = %reason, "permanent disconnect, disabling instance");
            if let Err(e) = self.store.set_enabled(id, false).await {
                warn!(instance_id = id, error = %e, "disable persist failed");
            }
            self.teardown_for_reconnect(id).await;
            let _ = self
                .store
                .update_status(id, "DISCONNECTED", Some(&reason.to_string()))
                .await;
            return;
        }

        if !enabled {
            info!(instance_id = id, reason = %reason, "instance disabled, not reconnecting");
            self.teardown_for_reconnect(id).await;
            let _ = self
                .store
                .update_status(id, "DISCONNECTED", Some(&reason.to_string()))
                .await;
            return;
        }

        let session_attempts = self.teardown_for_reconnect(id).await;
        let mut attempts = session_attempts.unwrap_or(persisted_attempts);

        // The counter wraps at the cap; the engine never gives up on count.
        if attempts >= self.policy.max_reconnect_attempts {
            info!(
                instance_id = id,
                attempts,
                "attempt cap reached, counter wraps to zero"
            );
            attempts = 0;
        }

        let delay = compute_delay(&reason, attempts, &self.policy);

        let _ = self
            .store
            .update_status(id, "RECONNECTING", Some(&reason.to_string()))
            .await;
        let _ = self.store.set_reconnect_attempts(id, attempts + 1).await;

        info!(
            instance_id = id,
            reason = %reason,
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );

        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        if let Err(e) = self.start_instance(id).await {
            // The recovery sweep picks the instance up again.
            error!(instance_id = id, error = %e, "restart failed");
        }
    }

    /// Remove the session and destroy its client without touching the
    /// persisted status (the reconnect pipeline owns that write).
    /// Returns the session's attempt counter when one existed.
    async fn teardown_for_reconnect(self: &Arc<Self>, id: &str) -> Option<u32> {
        let cell = self.registry.remove(id)?;
        let (client, attempts) = {
            let mut state = cell.lock().await;
            state.reconnecting = true;
            state.cancel_probes();
            if let Some(task) = state.event_task.take() {
                task.abort();
            }
            (state.client.take(), state.reconnect_attempts)
        };
        if let Some(client) = client {
            self.destroy_client(id, client).await;
        }
        Some(attempts)
    }
}
