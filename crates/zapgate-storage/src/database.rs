// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Database connection management with PRAGMA setup, WAL mode, and lifecycle.
//!
//! All writes are serialized through tokio-rusqlite's single background
//! thread. Do NOT create additional Connection instances for writes.

use tokio_rusqlite::Connection;
use tracing::debug;

use zapgate_core::ZapgateError;

use crate::migrations::run_migrations;

/// Columns the engine expects on `instances`. Rows deployed before a column
/// existed are upgraded in place at startup.
const INSTANCE_COLUMNS: &[(&str, &str)] = &[
    ("name", "TEXT NOT NULL DEFAULT ''"),
    ("webhook_url", "TEXT"),
    ("sistema_url", "TEXT"),
    ("api_token", "TEXT"),
    ("phone", "TEXT"),
    ("enabled", "INTEGER NOT NULL DEFAULT 1"),
    ("connection_status", "TEXT NOT NULL DEFAULT 'DISCONNECTED'"),
    ("last_connection_at", "TEXT"),
    ("last_disconnect_reason", "TEXT"),
    ("reconnect_attempts", "INTEGER NOT NULL DEFAULT 0"),
    ("created_at", "TEXT NOT NULL DEFAULT ''"),
];

/// Handle to the single-writer SQLite connection.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at `path`, configure PRAGMAs, and run
    /// migrations plus the missing-column upgrade.
    pub async fn open(path: &str) -> Result<Database, ZapgateError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ZapgateError::Storage { source: Box::new(e) })?;
            }
        }

        let conn = Connection::open(path)
            .await
            .map_err(|e| ZapgateError::Storage { source: Box::new(e) })?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA foreign_keys = ON;",
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)?;

        conn.call(|conn| {
            run_migrations(conn)
                .map_err(|e| tokio_rusqlite::Error::Other(e.to_string().into()))?;
            ensure_instance_columns(conn)?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)?;

        debug!(path, "database open, schema current");
        Ok(Database { conn })
    }

    /// The shared single-writer connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Checkpoint the WAL and close the connection.
    pub async fn close(&self) -> Result<(), ZapgateError> {
        self.conn
            .call(|conn| {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;
        debug!("WAL checkpoint complete");
        Ok(())
    }
}

/// Add any `instances` column an older deployment is missing.
fn ensure_instance_columns(
    conn: &mut rusqlite::Connection,
) -> Result<(), tokio_rusqlite::Error> {
    let mut present: Vec<String> = Vec::new();
    {
        let mut stmt = conn.prepare("PRAGMA table_info(instances)")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        for row in rows {
            present.push(row?);
        }
    }

    for (column, decl) in INSTANCE_COLUMNS {
        if !present.iter().any(|c| c == column) {
            debug!(column, "adding missing instances column");
            conn.execute_batch(&format!(
                "ALTER TABLE instances ADD COLUMN {column} {decl};"
            ))?;
        }
    }
    Ok(())
}

/// Map a tokio-rusqlite error into the workspace error type.
pub fn map_tr_err(e: tokio_rusqlite::Error) -> ZapgateError {
    ZapgateError::Storage {
        source: Box::new(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_database_file() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("open.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        assert!(db_path.exists());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn open_creates_missing_parent_directories() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested/deeper/open.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        assert!(db_path.exists());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_columns_are_added_on_open() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("upgrade.db");

        // Simulate an old deployment: a narrow instances table already on
        // disk. V1 is CREATE TABLE IF NOT EXISTS, so it leaves the narrow
        // table alone and the column upgrade has to fill the gap.
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE instances (id TEXT PRIMARY KEY, name TEXT NOT NULL DEFAULT '');",
            )
            .unwrap();
        }

        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();

        // The upgraded table accepts a full-width insert.
        db.connection()
            .call(|conn| {
                conn.execute(
                    "INSERT INTO instances
                         (id, name, enabled, connection_status, reconnect_attempts, created_at)
                     VALUES ('a', 'A', 1, 'DISCONNECTED', 0, '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_writers_no_sqlite_busy() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("concurrent.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let conn = db.connection().clone();
            handles.push(tokio::spawn(async move {
                conn.call(move |conn| {
                    conn.execute(
                        "INSERT INTO instances (id, name, created_at)
                         VALUES (?1, ?2, '2026-01-01T00:00:00Z')",
                        rusqlite::params![format!("inst-{i}"), format!("Instance {i}")],
                    )?;
                    Ok(())
                })
                .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        let count: i64 = db
            .connection()
            .call(|conn| {
                let n = conn.query_row("SELECT COUNT(*) FROM instances", [], |row| row.get(0))?;
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(count, 10);

        db.close().await.unwrap();
    }
}
