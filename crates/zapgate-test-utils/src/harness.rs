// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine test harness: temp SQLite, temp blob directory, mock client
//! factory, and a fast-interval policy so timing tests run in milliseconds.

use std::sync::Arc;
use std::time::Duration;

use zapgate_config::{DaemonConfig, EngineConfig};
use zapgate_core::{InstanceRecord, InstanceStatus, MetadataStore, ZapgateError};
use zapgate_engine::SessionEngine;
use zapgate_storage::{FsBlobStore, SqliteMetadataStore};

use crate::mock_client::MockClientFactory;

/// Everything a test needs to drive the engine end to end.
pub struct EngineHarness {
    pub engine: Arc<SessionEngine>,
    pub factory: Arc<MockClientFactory>,
    pub store: Arc<SqliteMetadataStore>,
    pub blobs: Arc<FsBlobStore>,
    /// Owns the on-disk state; dropped last.
    _dir: tempfile::TempDir,
}

/// Builder for [`EngineHarness`].
pub struct EngineHarnessBuilder {
    policy: EngineConfig,
    daemon: DaemonConfig,
    instances: Vec<InstanceRecord>,
}

impl Default for EngineHarnessBuilder {
    fn default() -> Self {
        Self {
            policy: fast_policy(),
            daemon: DaemonConfig::default(),
            instances: Vec::new(),
        }
    }
}

impl EngineHarnessBuilder {
    /// Override the engine policy entirely.
    pub fn with_policy(mut self, policy: EngineConfig) -> Self {
        self.policy = policy;
        self
    }

    /// Mutate the (fast) default policy in place.
    pub fn tune(mut self, f: impl FnOnce(&mut EngineConfig)) -> Self {
        f(&mut self.policy);
        self
    }

    /// Seed an instance row before the engine starts.
    pub fn with_instance(mut self, record: InstanceRecord) -> Self {
        self.instances.push(record);
        self
    }

    pub async fn build(self) -> Result<EngineHarness, ZapgateError> {
        let dir = tempfile::tempdir().map_err(|e| ZapgateError::Internal(e.to_string()))?;

        let db_path = dir.path().join("zapgate.db");
        let store = Arc::new(SqliteMetadataStore::new(db_path.to_str().unwrap()));
        store.initialize().await?;
        for record in &self.instances {
            store.upsert_instance(record).await?;
        }

        let blobs = Arc::new(FsBlobStore::open(dir.path().join("sessions")).await?);
        let factory = Arc::new(MockClientFactory::new());

        let engine = SessionEngine::new(
            store.clone(),
            blobs.clone(),
            factory.clone(),
            self.policy,
            self.daemon,
            dir.path().join("staging"),
        );

        Ok(EngineHarness {
            engine,
            factory,
            store,
            blobs,
            _dir: dir,
        })
    }
}

impl EngineHarness {
    pub fn builder() -> EngineHarnessBuilder {
        EngineHarnessBuilder::default()
    }

    /// Poll until the instance reaches `status` or the deadline passes.
    pub async fn wait_for_status(
        &self,
        id: &str,
        status: InstanceStatus,
        deadline: Duration,
    ) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if let Some((current, _)) = self.engine.status_of(id).await {
                if current == status {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Poll until `check` returns true or the deadline passes.
    pub async fn wait_until(&self, deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

/// The conservative defaults compressed to test scale: seconds become tens
/// of milliseconds, thresholds stay proportional.
pub fn fast_policy() -> EngineConfig {
    EngineConfig {
        init_timeout_secs: 2,
        loading_timeout_secs: 1,
        promotion_poll_secs: 1,
        promotion_max_polls: 3,
        heartbeat_interval_secs: 1,
        state_check_timeout_secs: 1,
        max_consecutive_failures: 3,
        max_context_errors: 4,
        deep_check_interval_secs: 2,
        deep_check_timeout_secs: 1,
        watchdog_interval_secs: 1,
        ping_timeout_secs: 3,
        recovery_interval_secs: 1,
        zombie_threshold_secs: 5,
        inactivity_threshold_secs: 5,
        memory_check_interval_secs: 60,
        destroy_timeout_secs: 1,
        graceful_shutdown_secs: 5,
        base_delay_ms: 50,
        max_delay_ms: 500,
        jitter_max_ms: 10,
        immediate_base_ms: 30,
        immediate_step_ms: 15,
        max_reconnect_attempts: 5,
        reconnect_reset_after_secs: 2,
        queue_capacity: 100,
        message_ttl_secs: 300,
        send_max_retries: 3,
        drain_stabilize_ms: 50,
        drain_pace_ms: 10,
        rehydrate_stagger_ms: 20,
        instance_heap_limit_mb: 512,
    }
}
