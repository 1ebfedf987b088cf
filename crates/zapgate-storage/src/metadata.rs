// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite implementation of the MetadataStore trait.

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::debug;

use zapgate_core::{InstanceRecord, MetadataStore, ZapgateError};

use crate::database::Database;
use crate::queries;

/// SQLite-backed metadata store.
///
/// Wraps a [`Database`] handle and delegates all query operations to the
/// typed query module. The database is lazily opened on the first call to
/// [`MetadataStore::initialize`].
pub struct SqliteMetadataStore {
    path: String,
    db: OnceCell<Database>,
}

impl SqliteMetadataStore {
    /// Create a new store pointing at `path`. The connection is not opened
    /// until [`initialize`](MetadataStore::initialize) is called.
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            db: OnceCell::new(),
        }
    }

    fn db(&self) -> Result<&Database, ZapgateError> {
        self.db.get().ok_or_else(|| ZapgateError::Storage {
            source: "metadata store not initialized -- call initialize() first".into(),
        })
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn initialize(&self) -> Result<(), ZapgateError> {
        let db = Database::open(&self.path).await?;
        self.db.set(db).map_err(|_| ZapgateError::Storage {
            source: "metadata store already initialized".into(),
        })?;
        debug!(path = %self.path, "metadata store initialized");
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, ZapgateError> {
        queries::instances::get_instance(self.db()?, id).await
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, ZapgateError> {
        queries::instances::list_instances(self.db()?).await
    }

    async fn list_enabled(&self) -> Result<Vec<InstanceRecord>, ZapgateError> {
        queries::instances::list_enabled(self.db()?).await
    }

    async fn upsert_instance(&self, record: &InstanceRecord) -> Result<(), ZapgateError> {
        queries::instances::upsert_instance(self.db()?, record).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), ZapgateError> {
        queries::instances::set_enabled(self.db()?, id, enabled).await
    }

    async fn update_status(
        &self,
        id: &str,
        status: &str,
        reason: Option<&str>,
    ) -> Result<(), ZapgateError> {
        queries::instances::update_status(self.db()?, id, status, reason).await
    }

    async fn record_connection(&self, id: &str, phone: Option<&str>) -> Result<(), ZapgateError> {
        queries::instances::record_connection(self.db()?, id, phone).await
    }

    async fn set_reconnect_attempts(&self, id: &str, attempts: u32) -> Result<(), ZapgateError> {
        queries::instances::set_reconnect_attempts(self.db()?, id, attempts).await
    }

    async fn close(&self) -> Result<(), ZapgateError> {
        if let Some(db) = self.db.get() {
            db.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn initialize_opens_database_at_configured_path() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("init.db");
        let store = SqliteMetadataStore::new(db_path.to_str().unwrap());

        store.initialize().await.unwrap();
        assert!(db_path.exists());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn initialize_twice_returns_error() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("double.db");
        let store = SqliteMetadataStore::new(db_path.to_str().unwrap());

        store.initialize().await.unwrap();
        assert!(store.initialize().await.is_err());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn queries_fail_before_initialize() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("uninit.db");
        let store = SqliteMetadataStore::new(db_path.to_str().unwrap());

        assert!(store.get_instance("a").await.is_err());
    }

    #[tokio::test]
    async fn full_instance_lifecycle_through_store() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("lifecycle.db");
        let store = SqliteMetadataStore::new(db_path.to_str().unwrap());
        store.initialize().await.unwrap();

        let record = InstanceRecord::new("inst-1", "Main line");
        store.upsert_instance(&record).await.unwrap();

        store
            .update_status("inst-1", "RECONNECTING", Some("NETWORK_ERROR"))
            .await
            .unwrap();
        store.record_connection("inst-1", Some("551199")).await.unwrap();
        store.set_reconnect_attempts("inst-1", 3).await.unwrap();

        let got = store.get_instance("inst-1").await.unwrap().unwrap();
        assert_eq!(got.connection_status, "CONNECTED");
        assert_eq!(got.phone.as_deref(), Some("551199"));
        assert_eq!(got.reconnect_attempts, 3);

        store.set_enabled("inst-1", false).await.unwrap();
        assert!(store.list_enabled().await.unwrap().is_empty());

        store.close().await.unwrap();
    }
}
