// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loading and policy constants for Zapgate.
//!
//! The `[engine]` section is the single home of the session engine's
//! intervals, timeouts, backoff parameters, and thresholds. Loading follows
//! the XDG hierarchy with `ZAPGATE_*` environment overrides.

pub mod loader;
pub mod model;

pub use loader::{load_config, load_config_from_path, load_config_from_str};
pub use model::{
    BridgeConfig, DaemonConfig, EngineConfig, ServerConfig, StorageConfig, ZapgateConfig,
};
