// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory session registry: the single owner of per-instance runtime state.
//!
//! Exactly one [`SessionState`] exists per instance id. Each state sits
//! behind its own async mutex so one instance's transitions serialise while
//! different instances proceed independently. Callers must not hold the
//! mutex across an adapter or database call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use zapgate_core::{DisconnectReason, InstanceStatus, WebClient};

/// Runtime state of one instance.
pub struct SessionState {
    pub instance_id: String,
    pub status: InstanceStatus,
    /// Live adapter handle; empty only in DISCONNECTED/INIT_ERROR.
    pub client: Option<Arc<dyn WebClient>>,
    /// Last QR payload while pairing.
    pub qr: Option<String>,

    pub created_at: Instant,
    pub created_at_utc: chrono::DateTime<chrono::Utc>,
    pub loading_started_at: Option<Instant>,
    pub last_activity: Instant,
    pub last_ping_ok: Instant,
    pub last_deep_check_ok: Option<Instant>,
    pub authenticated_at: Option<Instant>,
    pub connected_at: Option<Instant>,
    pub disconnected_at: Option<Instant>,

    pub reconnect_attempts: u32,
    pub consecutive_ping_failures: u32,
    pub context_error_count: u32,
    pub ws_check_failures: u32,

    pub reconnecting: bool,
    pub shutting_down: bool,
    pub needs_reconnect: bool,
    pub degraded: bool,
    /// Single-slot guard for the post-auth promotion poller.
    pub promotion_running: bool,

    /// Cancels the probe group collectively; armed only while CONNECTED.
    pub probe_cancel: Option<CancellationToken>,
    pub probe_tasks: Vec<JoinHandle<()>>,
    /// The task draining the adapter's event channel.
    pub event_task: Option<JoinHandle<()>>,

    pub phone: Option<String>,
    pub last_disconnect_reason: Option<DisconnectReason>,
}

impl SessionState {
    pub fn new(instance_id: &str) -> Self {
        let now = Instant::now();
        Self {
            instance_id: instance_id.to_string(),
            status: InstanceStatus::Initializing,
            client: None,
            qr: None,
            created_at: now,
            created_at_utc: chrono::Utc::now(),
            loading_started_at: None,
            last_activity: now,
            last_ping_ok: now,
            last_deep_check_ok: None,
            authenticated_at: None,
            connected_at: None,
            disconnected_at: None,
            reconnect_attempts: 0,
            consecutive_ping_failures: 0,
            context_error_count: 0,
            ws_check_failures: 0,
            reconnecting: false,
            shutting_down: false,
            needs_reconnect: false,
            degraded: false,
            promotion_running: false,
            probe_cancel: None,
            probe_tasks: Vec::new(),
            event_task: None,
            phone: None,
            last_disconnect_reason: None,
        }
    }

    /// Cancel the probe group and abort its tasks. Idempotent.
    pub fn cancel_probes(&mut self) {
        if let Some(token) = self.probe_cancel.take() {
            token.cancel();
        }
        for task in self.probe_tasks.drain(..) {
            task.abort();
        }
    }

    /// A shallow copy of the observable fields.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            instance_id: self.instance_id.clone(),
            status: self.status,
            has_qr: self.qr.is_some(),
            phone: self.phone.clone(),
            reconnect_attempts: self.reconnect_attempts,
            consecutive_ping_failures: self.consecutive_ping_failures,
            context_error_count: self.context_error_count,
            reconnecting: self.reconnecting,
            degraded: self.degraded,
            last_ping_ok: self.last_ping_ok,
            last_activity: self.last_activity,
            connected_at: self.connected_at,
            last_disconnect_reason: self
                .last_disconnect_reason
                .as_ref()
                .map(|r| r.to_string()),
        }
    }
}

/// Read-only copy of one session's observable state.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub has_qr: bool,
    pub phone: Option<String>,
    pub reconnect_attempts: u32,
    pub consecutive_ping_failures: u32,
    pub context_error_count: u32,
    pub reconnecting: bool,
    pub degraded: bool,
    pub last_ping_ok: Instant,
    pub last_activity: Instant,
    pub connected_at: Option<Instant>,
    pub last_disconnect_reason: Option<String>,
}

/// Map of `instance id -> session state`; the sole mutator of session state.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Mutex<SessionState>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the state for `id`, creating a fresh one if absent.
    ///
    /// The insert-if-absent is a single map operation, so concurrent
    /// callers converge on the same state instead of clobbering each other.
    pub fn get_or_create(&self, id: &str) -> Arc<Mutex<SessionState>> {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionState::new(id))))
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.remove(id).map(|(_, cell)| cell)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Shallow copies of every registered session.
    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut out = Vec::with_capacity(self.sessions.len());
        for id in self.ids() {
            if let Some(cell) = self.get(&id) {
                out.push(cell.lock().await.snapshot());
            }
        }
        out
    }

    /// Shallow copies of the sessions matching `predicate`.
    pub async fn filter(
        &self,
        predicate: impl Fn(&SessionSnapshot) -> bool,
    ) -> Vec<SessionSnapshot> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|snap| predicate(snap))
            .collect()
    }

    /// Session counts keyed by persisted status string.
    pub async fn count_by_status(&self) -> HashMap<&'static str, usize> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for snap in self.snapshot().await {
            *counts.entry(snap.status.as_db_str()).or_default() += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_remove_round_trip() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());

        registry.get_or_create("a");
        assert!(registry.contains("a"));
        assert_eq!(registry.len(), 1);

        let cell = registry.get("a").unwrap();
        assert_eq!(cell.lock().await.status, InstanceStatus::Initializing);

        assert!(registry.remove("a").is_some());
        assert!(!registry.contains("a"));
        assert!(registry.remove("a").is_none());
    }

    #[tokio::test]
    async fn get_or_create_converges_on_one_state() {
        let registry = SessionRegistry::new();
        let first = registry.get_or_create("a");
        first.lock().await.status = InstanceStatus::Connected;

        // A second caller gets the same state, not a fresh replacement.
        let again = registry.get_or_create("a");
        assert_eq!(again.lock().await.status, InstanceStatus::Connected);
        assert_eq!(registry.len(), 1, "exactly one state per id");
    }

    #[tokio::test]
    async fn snapshot_reflects_state() {
        let registry = SessionRegistry::new();
        let cell = registry.get_or_create("a");
        {
            let mut s = cell.lock().await;
            s.status = InstanceStatus::QrRequired;
            s.qr = Some("qr-payload".into());
        }

        let snaps = registry.snapshot().await;
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].status, InstanceStatus::QrRequired);
        assert!(snaps[0].has_qr);
    }

    #[tokio::test]
    async fn filter_selects_matching_sessions() {
        let registry = SessionRegistry::new();
        registry.get_or_create("a");
        let b = registry.get_or_create("b");
        b.lock().await.status = InstanceStatus::Connected;

        let connected = registry
            .filter(|snap| snap.status == InstanceStatus::Connected)
            .await;
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].instance_id, "b");

        let none = registry
            .filter(|snap| snap.status == InstanceStatus::AuthFailure)
            .await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn count_by_status_groups_sessions() {
        let registry = SessionRegistry::new();
        registry.get_or_create("a");
        registry.get_or_create("b");
        let c = registry.get_or_create("c");
        c.lock().await.status = InstanceStatus::Connected;

        let counts = registry.count_by_status().await;
        assert_eq!(counts.get("INITIALIZING"), Some(&2));
        assert_eq!(counts.get("CONNECTED"), Some(&1));
    }

    #[tokio::test]
    async fn cancel_probes_is_idempotent() {
        let mut state = SessionState::new("a");
        let token = CancellationToken::new();
        state.probe_cancel = Some(token.clone());
        state.probe_tasks.push(tokio::spawn(async {}));

        state.cancel_probes();
        assert!(token.is_cancelled());
        assert!(state.probe_tasks.is_empty());

        // Second call is a no-op.
        state.cancel_probes();
    }
}
