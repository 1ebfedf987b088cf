// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Filesystem auth-blob store.
//!
//! One opaque archive per session name under a configurable directory.
//! Operations on the same name are serialized through a per-name mutex so a
//! `save` for session X excludes a concurrent `extract`/`delete` for X.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use zapgate_core::{BlobStore, ZapgateError};

const ARCHIVE_EXT: &str = "zip";

/// Auth-blob store backed by a directory of archive files.
pub struct FsBlobStore {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FsBlobStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ZapgateError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| ZapgateError::Blob {
                message: format!("cannot create blob directory {}: {e}", root.display()),
                source: Some(Box::new(e)),
            })?;
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn archive_path(&self, name: &str) -> Result<PathBuf, ZapgateError> {
        validate_name(name)?;
        Ok(self.root.join(format!("{name}.{ARCHIVE_EXT}")))
    }
}

/// Session names become file names; anything path-like is rejected.
fn validate_name(name: &str) -> Result<(), ZapgateError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.contains('\0')
    {
        return Err(ZapgateError::Blob {
            message: format!("invalid session name: {name:?}"),
            source: None,
        });
    }
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn exists(&self, name: &str) -> Result<bool, ZapgateError> {
        let path = self.archive_path(name)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn save(&self, name: &str, archive: &Path) -> Result<(), ZapgateError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let dest = self.archive_path(name)?;
        let staged = dest.with_extension("tmp");

        tokio::fs::copy(archive, &staged)
            .await
            .map_err(|e| ZapgateError::Blob {
                message: format!("archive missing after save for {name}: {e}"),
                source: Some(Box::new(e)),
            })?;
        tokio::fs::rename(&staged, &dest)
            .await
            .map_err(|e| ZapgateError::Blob {
                message: format!("cannot finalize archive for {name}: {e}"),
                source: Some(Box::new(e)),
            })?;

        info!(session = name, "auth blob saved");
        Ok(())
    }

    async fn extract(&self, name: &str, dest: &Path) -> Result<(), ZapgateError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let path = self.archive_path(name)?;
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }
        tokio::fs::copy(&path, dest)
            .await
            .map_err(|e| ZapgateError::Blob {
                message: format!("no stored session for {name}: {e}"),
                source: Some(Box::new(e)),
            })?;

        debug!(session = name, "auth blob extracted");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ZapgateError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let path = self.archive_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(session = name, "auth blob deleted");
                Ok(())
            }
            // Deleting an absent blob is a no-op; reset and unpaired paths
            // call this without checking existence first.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ZapgateError::Blob {
                message: format!("cannot delete archive for {name}: {e}"),
                source: Some(Box::new(e)),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<String>, ZapgateError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| ZapgateError::Blob {
                message: format!("cannot list blob directory: {e}"),
                source: Some(Box::new(e)),
            })?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| ZapgateError::Blob {
            message: format!("cannot read blob directory entry: {e}"),
            source: Some(Box::new(e)),
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup() -> (FsBlobStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().join("blobs")).await.unwrap();
        (store, dir)
    }

    async fn write_archive(dir: &Path, content: &[u8]) -> PathBuf {
        let path = dir.join("staged.zip");
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    #[tokio::test]
    async fn save_then_exists_then_extract() {
        let (store, dir) = setup().await;
        let archive = write_archive(dir.path(), b"archive-bytes").await;

        assert!(!store.exists("RemoteAuth-A").await.unwrap());
        store.save("RemoteAuth-A", &archive).await.unwrap();
        assert!(store.exists("RemoteAuth-A").await.unwrap());

        let dest = dir.path().join("restored.zip");
        store.extract("RemoteAuth-A", &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"archive-bytes");
    }

    #[tokio::test]
    async fn extract_missing_blob_errors() {
        let (store, dir) = setup().await;
        let dest = dir.path().join("nope.zip");
        let err = store.extract("no-such", &dest).await.unwrap_err();
        assert!(err.to_string().contains("no stored session"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (store, dir) = setup().await;
        let archive = write_archive(dir.path(), b"x").await;

        store.save("a", &archive).await.unwrap();
        store.delete("a").await.unwrap();
        assert!(!store.exists("a").await.unwrap());
        // Second delete is a no-op.
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn list_returns_sorted_names() {
        let (store, dir) = setup().await;
        let archive = write_archive(dir.path(), b"x").await;

        store.save("RemoteAuth-B", &archive).await.unwrap();
        store.save("RemoteAuth-A", &archive).await.unwrap();

        let names = store.list().await.unwrap();
        assert_eq!(names, vec!["RemoteAuth-A", "RemoteAuth-B"]);
    }

    #[tokio::test]
    async fn path_like_names_are_rejected() {
        let (store, _dir) = setup().await;
        assert!(store.exists("../escape").await.is_err());
        assert!(store.exists("a/b").await.is_err());
        assert!(store.exists("").await.is_err());
    }

    #[tokio::test]
    async fn save_missing_archive_reports_blob_error() {
        let (store, dir) = setup().await;
        let missing = dir.path().join("not-there.zip");
        let err = store.save("a", &missing).await.unwrap_err();
        assert!(err.to_string().contains("archive missing after save"));
    }
}
