// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered config merging.
//!
//! Supports XDG hierarchy: `./zapgate.toml` > `~/.config/zapgate/zapgate.toml`
//! > `/etc/zapgate/zapgate.toml` with environment variable overrides via the
//! `ZAPGATE_` prefix, plus the bare operational variables (`PORT`,
//! `LOG_LEVEL`, `SESSION_STORAGE_PATH`, `CACHE_PATH`, `DATABASE_PATH`).

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

use crate::model::ZapgateConfig;

/// Load configuration from the standard XDG hierarchy with env var overrides.
///
/// Merge order (later overrides earlier):
/// 1. Compiled defaults
/// 2. `/etc/zapgate/zapgate.toml` (system-wide)
/// 3. `~/.config/zapgate/zapgate.toml` (user XDG config)
/// 4. `./zapgate.toml` (local directory)
/// 5. `ZAPGATE_*` environment variables
/// 6. Bare operational variables (`PORT`, `LOG_LEVEL`, ...)
pub fn load_config() -> Result<ZapgateConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(ZapgateConfig::default()))
        .merge(Toml::file("/etc/zapgate/zapgate.toml"))
        .merge(Toml::file(
            dirs::config_dir()
                .map(|d| d.join("zapgate/zapgate.toml"))
                .unwrap_or_default(),
        ))
        .merge(Toml::file("zapgate.toml"))
        .merge(env_provider())
        .merge(bare_env_provider())
        .extract()
}

/// Load configuration from TOML content only (no XDG lookup, no env).
///
/// Used for testing and explicit config file specification.
pub fn load_config_from_str(toml_content: &str) -> Result<ZapgateConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(ZapgateConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<ZapgateConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(ZapgateConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .merge(bare_env_provider())
        .extract()
}

/// Create the environment variable provider using explicit `map()` for
/// section-to-dot mapping.
///
/// Uses `Env::map()` NOT `Env::split("_")` to avoid ambiguity with
/// underscore-containing key names: `ZAPGATE_STORAGE_SESSION_STORAGE_PATH`
/// must map to `storage.session_storage_path`, not
/// `storage.session.storage.path`.
fn env_provider() -> Env {
    Env::prefixed("ZAPGATE_").map(|key| {
        let key_str = key.as_str();
        let mapped = key_str
            .replacen("server_", "server.", 1)
            .replacen("storage_", "storage.", 1)
            .replacen("bridge_", "bridge.", 1)
            .replacen("engine_", "engine.", 1)
            .replacen("daemon_", "daemon.", 1);
        mapped.into()
    })
}

/// Bare operational variables kept for deployment compatibility.
fn bare_env_provider() -> Env {
    Env::raw()
        .only(&[
            "PORT",
            "LOG_LEVEL",
            "SESSION_STORAGE_PATH",
            "CACHE_PATH",
            "DATABASE_PATH",
        ])
        .map(|key| {
            let key = key.as_str().to_ascii_lowercase();
            match key.as_str() {
                "port" => "server.port".into(),
                "log_level" => "daemon.log_level".into(),
                "session_storage_path" => "storage.session_storage_path".into(),
                "cache_path" => "storage.cache_path".into(),
                "database_path" => "storage.database_path".into(),
                _ => key.into(),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.server.port, 3333);
        assert_eq!(config.engine.heartbeat_interval_secs, 180);
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = load_config_from_str(
            r#"
            [server]
            port = 8080

            [engine]
            heartbeat_interval_secs = 60
            queue_capacity = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.engine.heartbeat_interval_secs, 60);
        assert_eq!(config.engine.queue_capacity, 10);
        // Untouched keys keep their defaults.
        assert_eq!(config.engine.ping_timeout_secs, 600);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let result = load_config_from_str(
            r#"
            [engine]
            hartbeat_interval_secs = 60
            "#,
        );
        assert!(result.is_err(), "typoed key should be rejected");
    }

    #[test]
    fn bridge_section_parses() {
        let config = load_config_from_str(
            r#"
            [bridge]
            base_url = "http://10.0.0.5:9001"
            "#,
        )
        .unwrap();
        assert_eq!(config.bridge.base_url, "http://10.0.0.5:9001");
        assert_eq!(config.bridge.request_timeout_secs, 30);
    }
}
