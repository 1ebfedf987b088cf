// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-instance state machine driver.
//!
//! `start_instance` creates the session, spawns the event pump, and races
//! adapter initialization against the hard init timeout. The event pump
//! drains the adapter's typed event channel and applies the transition
//! table; the promotion poller covers environments that never emit `ready`
//! after `authenticated`.
//!
//! The ordering contract: a CONNECTED transition persists to the metadata
//! store before probes are armed or the pending queue drains.

use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use tracing::{debug, error, info, warn};

use zapgate_core::{
    ClientEvent, ClientState, DisconnectReason, InstanceStatus, WebClient, ZapgateError,
};

use crate::SessionEngine;

impl SessionEngine {
    /// Start (or restart) an instance. A live session for the id is a
    /// no-op, and so is a second start racing one already in flight:
    /// the operator's start and the recovery sweep must never build two
    /// clients for one instance.
    pub async fn start_instance(self: &Arc<Self>, id: &str) -> Result<(), ZapgateError> {
        if self.shutdown.is_cancelled() {
            return Err(ZapgateError::Internal("engine is shutting down".into()));
        }

        match self.starts.entry(id.to_string()) {
            Entry::Occupied(_) => {
                debug!(instance_id = id, "start already in flight, dropped");
                return Ok(());
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let result = self.run_start(id).await;
        self.starts.remove(id);
        result
    }

    async fn run_start(self: &Arc<Self>, id: &str) -> Result<(), ZapgateError> {
        if let Some(cell) = self.registry.get(id) {
            let state = cell.lock().await;
            // AUTH_FAILURE never restarts on its own, but an explicit start
            // is the operator's way out of it.
            let restartable =
                state.status.is_terminal() || state.status == InstanceStatus::AuthFailure;
            if !restartable {
                debug!(instance_id = id, status = %state.status, "start ignored, session already live");
                return Ok(());
            }
            drop(state);
            // The stale terminal state is replaced wholesale; quiesce
            // whatever it still owns so nothing is orphaned.
            if let Some(old) = self.registry.remove(id) {
                let leftover = {
                    let mut old_state = old.lock().await;
                    old_state.cancel_probes();
                    if let Some(task) = old_state.event_task.take() {
                        task.abort();
                    }
                    old_state.client.take()
                };
                if let Some(client) = leftover {
                    self.destroy_client(id, client).await;
                }
            }
        }

        info!(instance_id = id, "starting instance");

        // Persist the in-progress marker first; losing the database is not
        // fatal to the start.
        if let Err(e) = self.store.update_status(id, "RECONNECTING", None).await {
            warn!(instance_id = id, error = %e, "status persist failed, continuing");
        }

        let attempts = match self.store.get_instance(id).await {
            Ok(Some(record)) => record.reconnect_attempts,
            Ok(None) => 0,
            Err(e) => {
                warn!(instance_id = id, error = %e, "attempt counter lookup failed");
                0
            }
        };

        let (client, events) = match self.factory.create(id).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(instance_id = id, error = %e, "client creation failed");
                let _ = self
                    .store
                    .update_status(id, "INIT_ERROR", Some(&DisconnectReason::InitTimeout.to_string()))
                    .await;
                // The recovery sweep restarts enabled instances with no session.
                return Err(e);
            }
        };

        let cell = self.registry.get_or_create(id);
        {
            let mut state = cell.lock().await;
            state.status = InstanceStatus::Initializing;
            state.loading_started_at = Some(Instant::now());
            state.client = Some(client.clone());
            state.reconnect_attempts = attempts;
        }

        // Event pump: one task per session draining the adapter channel.
        let pump_engine = self.clone();
        let pump_id = id.to_string();
        let pump = tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                pump_engine.handle_client_event(&pump_id, event).await;
            }
            debug!(instance_id = pump_id.as_str(), "client event channel closed");
        });
        {
            cell.lock().await.event_task = Some(pump);
        }

        // Initialization with a hard timeout; failure feeds the reconnector.
        let init_engine = self.clone();
        let init_id = id.to_string();
        let init_client = client;
        tokio::spawn(async move {
            let timeout = init_engine.policy.init_timeout();
            match Self::with_timeout(timeout, init_client.initialize()).await {
                Ok(()) => {
                    debug!(instance_id = init_id.as_str(), "adapter initialize returned");
                }
                Err(e) => {
                    init_engine.fail_initialization(&init_id, &e).await;
                }
            }
        });

        Ok(())
    }

    /// Initialization failed or timed out: tear the client down and enqueue
    /// a reconnect.
    async fn fail_initialization(self: &Arc<Self>, id: &str, cause: &ZapgateError) {
        let Some(cell) = self.registry.get(id) else {
            return;
        };
        {
            let mut state = cell.lock().await;
            if state.shutting_down || state.reconnecting {
                return;
            }
            // Events may have carried the session past initialization while
            // the timeout was pending.
            if matches!(
                state.status,
                InstanceStatus::Connected | InstanceStatus::QrRequired
            ) {
                debug!(instance_id = id, status = %state.status, "late init failure ignored");
                return;
            }
            state.status = InstanceStatus::InitError;
        }

        error!(instance_id = id, error = %cause, "initialization failed");
        let _ = self
            .store
            .update_status(id, "INIT_ERROR", Some(&DisconnectReason::InitTimeout.to_string()))
            .await;
        self.schedule_reconnect(id, DisconnectReason::InitTimeout);
    }

    /// Apply one adapter event to the session's state machine.
    pub(crate) async fn handle_client_event(self: &Arc<Self>, id: &str, event: ClientEvent) {
        let Some(cell) = self.registry.get(id) else {
            return;
        };

        match event {
            ClientEvent::Qr(payload) => {
                {
                    let mut state = cell.lock().await;
                    if state.shutting_down {
                        return;
                    }
                    state.status = InstanceStatus::QrRequired;
                    state.qr = Some(payload);
                    state.loading_started_at = None;
                }
                info!(instance_id = id, "pairing QR received");
                let _ = self.store.update_status(id, "QR_REQUIRED", None).await;
            }

            ClientEvent::Loading { percent, message } => {
                let mut state = cell.lock().await;
                if state.shutting_down {
                    return;
                }
                if state.loading_started_at.is_none() {
                    state.loading_started_at = Some(Instant::now());
                }
                state.status = InstanceStatus::Loading(percent);
                debug!(instance_id = id, percent, message = message.as_str(), "sync progress");
            }

            ClientEvent::Authenticated => {
                {
                    let mut state = cell.lock().await;
                    if state.shutting_down {
                        return;
                    }
                    state.status = InstanceStatus::Authenticated;
                    state.authenticated_at = Some(Instant::now());
                }
                info!(instance_id = id, "authenticated");
                let _ = self.store.update_status(id, "AUTHENTICATED", None).await;
                self.spawn_promotion(id);
            }

            ClientEvent::Ready => {
                self.promote_to_connected(id, "ready event").await;
            }

            ClientEvent::AuthFailure(message) => {
                {
                    let mut state = cell.lock().await;
                    state.status = InstanceStatus::AuthFailure;
                    state.cancel_probes();
                    state.last_disconnect_reason =
                        Some(DisconnectReason::Other(message.clone()));
                }
                error!(instance_id = id, reason = message.as_str(), "authentication failed, manual action required");
                let _ = self
                    .store
                    .update_status(id, "AUTH_FAILURE", Some(&message))
                    .await;
                // No automatic reconnect from AUTH_FAILURE.
            }

            ClientEvent::Disconnected(raw) => {
                let reason = DisconnectReason::classify(&raw);
                let shutting_down = {
                    let mut state = cell.lock().await;
                    state.status = InstanceStatus::Disconnected;
                    state.disconnected_at = Some(Instant::now());
                    state.last_disconnect_reason = Some(reason.clone());
                    state.cancel_probes();
                    state.shutting_down
                };
                warn!(instance_id = id, reason = %reason, "disconnected");
                let _ = self
                    .store
                    .update_status(id, "DISCONNECTED", Some(&reason.to_string()))
                    .await;
                if !shutting_down {
                    self.schedule_reconnect(id, reason);
                }
            }

            ClientEvent::ChangeState(state_change) => {
                self.handle_state_observation(id, state_change).await;
            }

            ClientEvent::RemoteSessionSaved => {
                let name = Self::blob_name(id);
                let staged = self.staging_dir.join(format!("{name}.zip"));
                match self.blobs.save(&name, &staged).await {
                    Ok(()) => debug!(instance_id = id, "auth blob stored"),
                    Err(e) => {
                        // Missing archive degrades to "no session present";
                        // the next start falls through to a fresh QR.
                        warn!(instance_id = id, error = %e, "auth blob save failed");
                    }
                }
            }

            ClientEvent::Message(_payload) => {
                let mut state = cell.lock().await;
                state.last_activity = Instant::now();
                debug!(instance_id = id, "inbound message activity");
            }
        }
    }

    /// An adapter state observed outside the normal event flow
    /// (`change_state` events and probe observations).
    pub(crate) async fn handle_state_observation(self: &Arc<Self>, id: &str, observed: ClientState) {
        match observed {
            ClientState::Connected => {
                // Covers a missed `ready` event.
                self.promote_to_connected(id, "state observation").await;
            }
            ClientState::Conflict => {
                self.attempt_takeover(id).await;
            }
            ClientState::Unpaired | ClientState::UnpairedIdle => {
                self.handle_unpaired(id).await;
            }
            other => {
                debug!(instance_id = id, state = %other, "client state change");
            }
        }
    }

    /// Another device claimed the session: take it back, then re-observe.
    async fn attempt_takeover(self: &Arc<Self>, id: &str) {
        let Some(cell) = self.registry.get(id) else {
            return;
        };
        let client = {
            let state = cell.lock().await;
            if state.reconnecting || state.shutting_down {
                return;
            }
            state.client.clone()
        };
        let Some(client) = client else { return };

        warn!(instance_id = id, "session conflict, attempting takeover");
        match Self::with_timeout(self.policy.state_check_timeout(), client.take_over()).await {
            Ok(()) => {
                match Self::with_timeout(self.policy.state_check_timeout(), client.get_state()).await
                {
                    Ok(ClientState::Connected) => {
                        info!(instance_id = id, "takeover succeeded");
                        self.promote_to_connected(id, "takeover").await;
                    }
                    Ok(other) => {
                        warn!(instance_id = id, state = %other, "takeover did not reconnect");
                    }
                    Err(e) => {
                        warn!(instance_id = id, error = %e, "state check after takeover failed");
                    }
                }
            }
            Err(e) => {
                warn!(instance_id = id, error = %e, "takeover failed");
                self.schedule_reconnect(id, DisconnectReason::Conflict);
            }
        }
    }

    /// The phone unlinked this session: the stored blob is stale. Delete it
    /// and wait for a fresh QR.
    async fn handle_unpaired(self: &Arc<Self>, id: &str) {
        warn!(instance_id = id, "session unpaired, discarding stale auth blob");
        if let Err(e) = self.blobs.delete(&Self::blob_name(id)).await {
            warn!(instance_id = id, error = %e, "stale blob delete failed");
        }

        let Some(cell) = self.registry.get(id) else {
            return;
        };
        {
            let mut state = cell.lock().await;
            if state.shutting_down {
                return;
            }
            state.cancel_probes();
            state.status = InstanceStatus::QrRequired;
            state.qr = None;
        }
        let _ = self.store.update_status(id, "QR_REQUIRED", None).await;
    }

    /// Promote a session to CONNECTED: persist first, then arm probes and
    /// drain the pending queue.
    pub(crate) async fn promote_to_connected(self: &Arc<Self>, id: &str, via: &str) {
        let Some(cell) = self.registry.get(id) else {
            return;
        };

        let client = {
            let mut state = cell.lock().await;
            if state.shutting_down || state.reconnecting {
                return;
            }
            if state.status == InstanceStatus::Connected {
                return;
            }
            state.status = InstanceStatus::Connected;
            state.connected_at = Some(Instant::now());
            state.last_ping_ok = Instant::now();
            state.last_activity = Instant::now();
            state.consecutive_ping_failures = 0;
            state.context_error_count = 0;
            state.qr = None;
            state.loading_started_at = None;
            state.client.clone()
        };

        // Phone identity is best-effort; a slow adapter must not stall the
        // promotion path.
        let phone = match &client {
            Some(client) => {
                Self::with_timeout(self.policy.state_check_timeout(), client.info())
                    .await
                    .ok()
                    .flatten()
                    .and_then(|info| info.phone)
            }
            None => None,
        };

        if let Err(e) = self.store.record_connection(id, phone.as_deref()).await {
            warn!(instance_id = id, error = %e, "connection persist failed, continuing");
        }

        if let Some(phone) = phone {
            cell.lock().await.phone = Some(phone);
        }

        info!(instance_id = id, via, "connected");

        self.arm_probes(id).await;
        self.spawn_drain(id);
    }

    /// Poll the adapter after `authenticated` until it reports CONNECTED;
    /// some environments never emit `ready`. Single-slot per session.
    pub(crate) fn spawn_promotion(self: &Arc<Self>, id: &str) {
        let engine = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            {
                let Some(cell) = engine.registry.get(&id) else {
                    return;
                };
                let mut state = cell.lock().await;
                if state.promotion_running {
                    debug!(instance_id = id.as_str(), "promotion poller already running");
                    return;
                }
                state.promotion_running = true;
            }

            engine.run_promotion(&id).await;

            if let Some(cell) = engine.registry.get(&id) {
                cell.lock().await.promotion_running = false;
            }
        });
    }

    async fn run_promotion(self: &Arc<Self>, id: &str) {
        let max_polls = self.policy.promotion_max_polls;
        for poll in 1..=max_polls {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.policy.promotion_poll()) => {}
            }

            let Some(cell) = self.registry.get(id) else {
                return;
            };
            let (client, done) = {
                let state = cell.lock().await;
                let done = state.status == InstanceStatus::Connected
                    || state.reconnecting
                    || state.shutting_down;
                (state.client.clone(), done)
            };
            if done {
                return;
            }
            let Some(client) = client else { return };

            match Self::with_timeout(self.policy.state_check_timeout(), client.get_state()).await {
                Ok(ClientState::Connected) => {
                    self.promote_to_connected(id, "promotion poll").await;
                    return;
                }
                Ok(other) => {
                    debug!(instance_id = id, poll, state = %other, "promotion poll, not connected yet");
                }
                Err(e) => {
                    debug!(instance_id = id, poll, error = %e, "promotion poll failed");
                }
            }
        }

        // Every poll missed: the session authenticated but never synced.
        let Some(cell) = self.registry.get(id) else {
            return;
        };
        {
            let mut state = cell.lock().await;
            if state.status == InstanceStatus::Connected
                || state.reconnecting
                || state.shutting_down
            {
                return;
            }
            state.status = InstanceStatus::SyncTimeout;
        }
        warn!(instance_id = id, "never reached CONNECTED after authentication");
        let _ = self
            .store
            .update_status(id, "SYNC_TIMEOUT", Some(&DisconnectReason::SyncTimeout.to_string()))
            .await;
        self.schedule_reconnect(id, DisconnectReason::SyncTimeout);
    }

    /// Stop an instance: clear intent so the recovery sweep does not
    /// resurrect it, then tear the session down.
    pub async fn stop_instance(self: &Arc<Self>, id: &str) -> Result<(), ZapgateError> {
        info!(instance_id = id, "stopping instance");
        if let Err(e) = self.store.set_enabled(id, false).await {
            warn!(instance_id = id, error = %e, "intent persist failed, continuing");
        }
        self.teardown_session(id, &DisconnectReason::Manual).await;
        Ok(())
    }

    /// Delete the local auth blob and restart from scratch.
    pub async fn reset_instance(self: &Arc<Self>, id: &str) -> Result<(), ZapgateError> {
        info!(instance_id = id, "resetting instance");
        self.teardown_session(id, &DisconnectReason::Manual).await;
        self.blobs.delete(&Self::blob_name(id)).await?;
        self.start_instance(id).await
    }

    /// Remove the session, destroy its client, and persist DISCONNECTED.
    pub(crate) async fn teardown_session(self: &Arc<Self>, id: &str, reason: &DisconnectReason) {
        let Some(cell) = self.registry.remove(id) else {
            let _ = self
                .store
                .update_status(id, "DISCONNECTED", Some(&reason.to_string()))
                .await;
            return;
        };

        let client = {
            let mut state = cell.lock().await;
            state.reconnecting = true;
            state.cancel_probes();
            if let Some(task) = state.event_task.take() {
                task.abort();
            }
            state.client.take()
        };

        let _ = self
            .store
            .update_status(id, "DISCONNECTED", Some(&reason.to_string()))
            .await;

        if let Some(client) = client {
            self.destroy_client(id, client).await;
        }
    }

    /// Destroy an adapter under the destroy timeout, swallowing torn-down
    /// errors; everything else is logged.
    pub(crate) async fn destroy_client(&self, id: &str, client: Arc<dyn WebClient>) {
        match Self::with_timeout(self.policy.destroy_timeout(), client.destroy()).await {
            Ok(()) => debug!(instance_id = id, "client destroyed"),
            Err(e) if e.is_torn_down() => {
                debug!(instance_id = id, "client already torn down");
            }
            Err(e) => warn!(instance_id = id, error = %e, "client destroy failed"),
        }
    }
}
