// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistence traits: the instance metadata store and the auth blob store.

use std::path::Path;

use async_trait::async_trait;

use crate::error::ZapgateError;
use crate::types::InstanceRecord;

/// Durable table of per-instance intent and last-known connection state.
///
/// The store is the authority on *intent* (`enabled`); the in-memory
/// registry is the authority on live state. Database failures must be
/// survivable: callers log and continue rather than crash.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Open the store and bring the schema up to date.
    async fn initialize(&self) -> Result<(), ZapgateError>;

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, ZapgateError>;

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, ZapgateError>;

    /// Rows with `enabled = true`; the sole input to rehydration and the
    /// recovery sweep.
    async fn list_enabled(&self) -> Result<Vec<InstanceRecord>, ZapgateError>;

    /// Insert or replace a full row.
    async fn upsert_instance(&self, record: &InstanceRecord) -> Result<(), ZapgateError>;

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), ZapgateError>;

    /// Persist the observational connection status plus an optional
    /// disconnect reason.
    async fn update_status(
        &self,
        id: &str,
        status: &str,
        reason: Option<&str>,
    ) -> Result<(), ZapgateError>;

    /// Record a successful connection: status, timestamp, and phone id.
    async fn record_connection(&self, id: &str, phone: Option<&str>) -> Result<(), ZapgateError>;

    async fn set_reconnect_attempts(&self, id: &str, attempts: u32) -> Result<(), ZapgateError>;

    /// Checkpoint and close the store.
    async fn close(&self) -> Result<(), ZapgateError>;
}

/// Durable key/value store of `session name -> opaque auth archive`.
///
/// The engine never interprets archive content. Operations on the same name
/// are serialised: a `save` for session X excludes `extract`/`delete` for X.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool, ZapgateError>;

    /// Ingest the archive the adapter wrote at `archive` into the store.
    async fn save(&self, name: &str, archive: &Path) -> Result<(), ZapgateError>;

    /// Copy the stored archive for `name` to `dest`.
    async fn extract(&self, name: &str, dest: &Path) -> Result<(), ZapgateError>;

    async fn delete(&self, name: &str) -> Result<(), ZapgateError>;

    async fn list(&self) -> Result<Vec<String>, ZapgateError>;
}
