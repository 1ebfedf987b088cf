// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the Zapgate gateway.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup. The `[engine]` section is the single home of
//! every interval, timeout, backoff parameter, and threshold the session
//! engine consults; the defaults are the conservative set.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Zapgate configuration.
///
/// Loaded from TOML files following XDG hierarchy, with environment variable
/// overrides. All sections are optional and default to sensible values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ZapgateConfig {
    /// HTTP API settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database and auth-blob storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Browser automation sidecar settings.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Session engine policy: intervals, timeouts, backoff, thresholds.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Process-level settings: logging and memory accounting.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// HTTP API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token for the admin API (None = auth disabled).
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bearer_token: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3333
}

/// Storage configuration: metadata database plus the auth-blob directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Directory holding one auth archive per session name.
    #[serde(default = "default_session_storage_path")]
    pub session_storage_path: String,

    /// Scratch directory for archive staging during save/extract.
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            session_storage_path: default_session_storage_path(),
            cache_path: default_cache_path(),
        }
    }
}

fn default_database_path() -> String {
    "zapgate.db".to_string()
}

fn default_session_storage_path() -> String {
    "sessions".to_string()
}

fn default_cache_path() -> String {
    ".cache".to_string()
}

/// Browser automation sidecar configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Base URL of the automation sidecar.
    #[serde(default = "default_bridge_url")]
    pub base_url: String,

    /// Per-request HTTP timeout, seconds. Lifecycle-level timeouts
    /// (initialize, destroy) are enforced by the engine on top of this.
    #[serde(default = "default_bridge_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: default_bridge_url(),
            request_timeout_secs: default_bridge_timeout_secs(),
        }
    }
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:8088".to_string()
}

fn default_bridge_timeout_secs() -> u64 {
    30
}

/// Session engine policy.
///
/// Seconds/milliseconds fields carry the unit in their name; the typed
/// accessors below are what the engine reads.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Hard cap on adapter initialization.
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,

    /// How long an instance may sit in INITIALIZING/LOADING before the
    /// sweep declares it stuck.
    #[serde(default = "default_loading_timeout_secs")]
    pub loading_timeout_secs: u64,

    /// Spacing between post-auth promotion polls.
    #[serde(default = "default_promotion_poll_secs")]
    pub promotion_poll_secs: u64,

    /// Promotion polls before giving up and declaring a sync timeout.
    #[serde(default = "default_promotion_max_polls")]
    pub promotion_max_polls: u32,

    /// Heartbeat probe period.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Timeout on each `get_state` call.
    #[serde(default = "default_state_check_timeout_secs")]
    pub state_check_timeout_secs: u64,

    /// Consecutive heartbeat failures before a reconnect.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Torn-down-context errors before a reconnect.
    #[serde(default = "default_max_context_errors")]
    pub max_context_errors: u32,

    /// Deep probe period.
    #[serde(default = "default_deep_check_interval_secs")]
    pub deep_check_interval_secs: u64,

    /// Timeout on the deep probe's socket/heap checks.
    #[serde(default = "default_deep_check_timeout_secs")]
    pub deep_check_timeout_secs: u64,

    /// Watchdog period.
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,

    /// Silence on `last_ping_ok` beyond this triggers a reconnect.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    /// Global recovery sweep period.
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,

    /// CONNECTED with pings silent beyond this is a zombie.
    #[serde(default = "default_zombie_threshold_secs")]
    pub zombie_threshold_secs: u64,

    /// CONNECTED with no traffic beyond this gets an on-demand heartbeat.
    #[serde(default = "default_inactivity_threshold_secs")]
    pub inactivity_threshold_secs: u64,

    /// Memory monitor sampling period.
    #[serde(default = "default_memory_check_interval_secs")]
    pub memory_check_interval_secs: u64,

    /// Timeout on `destroy` during teardown.
    #[serde(default = "default_destroy_timeout_secs")]
    pub destroy_timeout_secs: u64,

    /// Hard deadline on the whole shutdown procedure.
    #[serde(default = "default_graceful_shutdown_secs")]
    pub graceful_shutdown_secs: u64,

    /// Exponential backoff base delay.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Exponential backoff ceiling.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Uniform jitter added to non-immediate delays.
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,

    /// Base delay for immediate-class reasons.
    #[serde(default = "default_immediate_base_ms")]
    pub immediate_base_ms: u64,

    /// Linear step per attempt for immediate-class reasons.
    #[serde(default = "default_immediate_step_ms")]
    pub immediate_step_ms: u64,

    /// Attempt count at which the counter wraps to zero. The engine never
    /// stops retrying on count alone.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// CONNECTED must hold this long before the attempt counter clears.
    #[serde(default = "default_reconnect_reset_after_secs")]
    pub reconnect_reset_after_secs: u64,

    /// Pending queue capacity per instance; overflow evicts the oldest.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Pending messages older than this are dropped at drain.
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,

    /// Send attempts per queued message before it is dropped.
    #[serde(default = "default_send_max_retries")]
    pub send_max_retries: u32,

    /// Wait after CONNECTED before draining the queue.
    #[serde(default = "default_drain_stabilize_ms")]
    pub drain_stabilize_ms: u64,

    /// Pause between drained messages.
    #[serde(default = "default_drain_pace_ms")]
    pub drain_pace_ms: u64,

    /// Stagger between instance starts at boot.
    #[serde(default = "default_rehydrate_stagger_ms")]
    pub rehydrate_stagger_ms: u64,

    /// Per-instance browser heap limit checked by the deep probe, MB.
    #[serde(default = "default_instance_heap_limit_mb")]
    pub instance_heap_limit_mb: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            init_timeout_secs: default_init_timeout_secs(),
            loading_timeout_secs: default_loading_timeout_secs(),
            promotion_poll_secs: default_promotion_poll_secs(),
            promotion_max_polls: default_promotion_max_polls(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            state_check_timeout_secs: default_state_check_timeout_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_context_errors: default_max_context_errors(),
            deep_check_interval_secs: default_deep_check_interval_secs(),
            deep_check_timeout_secs: default_deep_check_timeout_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            recovery_interval_secs: default_recovery_interval_secs(),
            zombie_threshold_secs: default_zombie_threshold_secs(),
            inactivity_threshold_secs: default_inactivity_threshold_secs(),
            memory_check_interval_secs: default_memory_check_interval_secs(),
            destroy_timeout_secs: default_destroy_timeout_secs(),
            graceful_shutdown_secs: default_graceful_shutdown_secs(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            immediate_base_ms: default_immediate_base_ms(),
            immediate_step_ms: default_immediate_step_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_reset_after_secs: default_reconnect_reset_after_secs(),
            queue_capacity: default_queue_capacity(),
            message_ttl_secs: default_message_ttl_secs(),
            send_max_retries: default_send_max_retries(),
            drain_stabilize_ms: default_drain_stabilize_ms(),
            drain_pace_ms: default_drain_pace_ms(),
            rehydrate_stagger_ms: default_rehydrate_stagger_ms(),
            instance_heap_limit_mb: default_instance_heap_limit_mb(),
        }
    }
}

impl EngineConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }
    pub fn loading_timeout(&self) -> Duration {
        Duration::from_secs(self.loading_timeout_secs)
    }
    pub fn promotion_poll(&self) -> Duration {
        Duration::from_secs(self.promotion_poll_secs)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
    pub fn state_check_timeout(&self) -> Duration {
        Duration::from_secs(self.state_check_timeout_secs)
    }
    pub fn deep_check_interval(&self) -> Duration {
        Duration::from_secs(self.deep_check_interval_secs)
    }
    pub fn deep_check_timeout(&self) -> Duration {
        Duration::from_secs(self.deep_check_timeout_secs)
    }
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
    pub fn zombie_threshold(&self) -> Duration {
        Duration::from_secs(self.zombie_threshold_secs)
    }
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_secs)
    }
    pub fn memory_check_interval(&self) -> Duration {
        Duration::from_secs(self.memory_check_interval_secs)
    }
    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_secs(self.destroy_timeout_secs)
    }
    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_secs)
    }
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
    pub fn immediate_base(&self) -> Duration {
        Duration::from_millis(self.immediate_base_ms)
    }
    pub fn reconnect_reset_after(&self) -> Duration {
        Duration::from_secs(self.reconnect_reset_after_secs)
    }
    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }
    pub fn drain_stabilize(&self) -> Duration {
        Duration::from_millis(self.drain_stabilize_ms)
    }
    pub fn drain_pace(&self) -> Duration {
        Duration::from_millis(self.drain_pace_ms)
    }
    pub fn rehydrate_stagger(&self) -> Duration {
        Duration::from_millis(self.rehydrate_stagger_ms)
    }
    pub fn instance_heap_limit_bytes(&self) -> u64 {
        self.instance_heap_limit_mb * 1024 * 1024
    }
}

fn default_init_timeout_secs() -> u64 {
    180
}
fn default_loading_timeout_secs() -> u64 {
    300
}
fn default_promotion_poll_secs() -> u64 {
    15
}
fn default_promotion_max_polls() -> u32 {
    10
}
fn default_heartbeat_interval_secs() -> u64 {
    180
}
fn default_state_check_timeout_secs() -> u64 {
    15
}
fn default_max_consecutive_failures() -> u32 {
    10
}
fn default_max_context_errors() -> u32 {
    15
}
fn default_deep_check_interval_secs() -> u64 {
    1800
}
fn default_deep_check_timeout_secs() -> u64 {
    20
}
fn default_watchdog_interval_secs() -> u64 {
    60
}
// 180 s heartbeats against a 600 s ping timeout leaves at most three beats
// before the watchdog reconnects. Tight but intentional.
fn default_ping_timeout_secs() -> u64 {
    600
}
fn default_recovery_interval_secs() -> u64 {
    60
}
fn default_zombie_threshold_secs() -> u64 {
    1800
}
fn default_inactivity_threshold_secs() -> u64 {
    900
}
fn default_memory_check_interval_secs() -> u64 {
    900
}
fn default_destroy_timeout_secs() -> u64 {
    10
}
fn default_graceful_shutdown_secs() -> u64 {
    30
}
fn default_base_delay_ms() -> u64 {
    5_000
}
fn default_max_delay_ms() -> u64 {
    300_000
}
fn default_jitter_max_ms() -> u64 {
    3_000
}
fn default_immediate_base_ms() -> u64 {
    3_000
}
fn default_immediate_step_ms() -> u64 {
    1_500
}
fn default_max_reconnect_attempts() -> u32 {
    20
}
fn default_reconnect_reset_after_secs() -> u64 {
    1_800
}
fn default_queue_capacity() -> usize {
    100
}
fn default_message_ttl_secs() -> u64 {
    300
}
fn default_send_max_retries() -> u32 {
    3
}
fn default_drain_stabilize_ms() -> u64 {
    2_000
}
fn default_drain_pace_ms() -> u64 {
    500
}
fn default_rehydrate_stagger_ms() -> u64 {
    2_000
}
fn default_instance_heap_limit_mb() -> u64 {
    512
}

/// Process-level configuration: logging and memory accounting.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Heap warning threshold for the process memory monitor, MB.
    #[serde(default = "default_memory_warn_mb")]
    pub memory_warn_mb: u64,

    /// Heap critical threshold; crossing it sheds the oldest connected
    /// session.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            memory_warn_mb: default_memory_warn_mb(),
            memory_limit_mb: default_memory_limit_mb(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_memory_warn_mb() -> u64 {
    1024
}

fn default_memory_limit_mb() -> u64 {
    2048
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults_are_the_conservative_set() {
        let engine = EngineConfig::default();
        assert_eq!(engine.init_timeout_secs, 180);
        assert_eq!(engine.heartbeat_interval_secs, 180);
        assert_eq!(engine.ping_timeout_secs, 600);
        assert_eq!(engine.deep_check_interval_secs, 1800);
        assert_eq!(engine.zombie_threshold_secs, 1800);
        assert_eq!(engine.max_reconnect_attempts, 20);
        assert_eq!(engine.queue_capacity, 100);
        assert_eq!(engine.message_ttl_secs, 300);
        assert_eq!(engine.max_delay_ms, 300_000);
    }

    #[test]
    fn duration_accessors_match_raw_fields() {
        let engine = EngineConfig::default();
        assert_eq!(engine.init_timeout(), Duration::from_secs(180));
        assert_eq!(engine.immediate_base(), Duration::from_millis(3_000));
        assert_eq!(engine.drain_pace(), Duration::from_millis(500));
        assert_eq!(
            engine.instance_heap_limit_bytes(),
            512 * 1024 * 1024
        );
    }

    #[test]
    fn top_level_default_builds() {
        let config = ZapgateConfig::default();
        assert_eq!(config.server.port, 3333);
        assert_eq!(config.storage.database_path, "zapgate.db");
        assert_eq!(config.daemon.log_level, "info");
    }
}
