// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Instance row CRUD operations.

use rusqlite::params;
use zapgate_core::{InstanceRecord, ZapgateError};

use crate::database::{map_tr_err, Database};

const SELECT_COLUMNS: &str = "id, name, webhook_url, sistema_url, api_token, phone, enabled, \
     connection_status, last_connection_at, last_disconnect_reason, reconnect_attempts, created_at";

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<InstanceRecord, rusqlite::Error> {
    Ok(InstanceRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        webhook_url: row.get(2)?,
        sistema_url: row.get(3)?,
        api_token: row.get(4)?,
        phone: row.get(5)?,
        enabled: row.get::<_, i64>(6)? != 0,
        connection_status: row.get(7)?,
        last_connection_at: row.get(8)?,
        last_disconnect_reason: row.get(9)?,
        reconnect_attempts: row.get::<_, i64>(10)? as u32,
        created_at: row.get(11)?,
    })
}

/// Get an instance row by id.
pub async fn get_instance(db: &Database, id: &str) -> Result<Option<InstanceRecord>, ZapgateError> {
    let id = id.to_string();
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM instances WHERE id = ?1"
            ))?;
            match stmt.query_row(params![id], row_to_record) {
                Ok(record) => Ok(Some(record)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
        .map_err(map_tr_err)
}

/// List all instance rows, oldest first.
pub async fn list_instances(db: &Database) -> Result<Vec<InstanceRecord>, ZapgateError> {
    db.connection()
        .call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM instances ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map([], row_to_record)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await
        .map_err(map_tr_err)
}

/// List rows with `enabled = true`, oldest first.
pub async fn list_enabled(db: &Database) -> Result<Vec<InstanceRecord>, ZapgateError> {
    db.connection()
        .call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM instances WHERE enabled = 1 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map([], row_to_record)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await
        .map_err(map_tr_err)
}

/// Insert or replace a full instance row.
pub async fn upsert_instance(db: &Database, record: &InstanceRecord) -> Result<(), ZapgateError> {
    let record = record.clone();
    db.connection()
        .call(move |conn| {
            conn.execute(
                "INSERT INTO instances
                     (id, name, webhook_url, sistema_url, api_token, phone, enabled,
                      connection_status, last_connection_at, last_disconnect_reason,
                      reconnect_attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     webhook_url = excluded.webhook_url,
                     sistema_url = excluded.sistema_url,
                     api_token = excluded.api_token,
                     phone = excluded.phone,
                     enabled = excluded.enabled,
                     connection_status = excluded.connection_status,
                     last_connection_at = excluded.last_connection_at,
                     last_disconnect_reason = excluded.last_disconnect_reason,
                     reconnect_attempts = excluded.reconnect_attempts",
                params![
                    record.id,
                    record.name,
                    record.webhook_url,
                    record.sistema_url,
                    record.api_token,
                    record.phone,
                    record.enabled as i64,
                    record.connection_status,
                    record.last_connection_at,
                    record.last_disconnect_reason,
                    record.reconnect_attempts as i64,
                    record.created_at,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Toggle the durable intent flag.
pub async fn set_enabled(db: &Database, id: &str, enabled: bool) -> Result<(), ZapgateError> {
    let id = id.to_string();
    db.connection()
        .call(move |conn| {
            conn.execute(
                "UPDATE instances SET enabled = ?1 WHERE id = ?2",
                params![enabled as i64, id],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Persist the observational connection status plus an optional reason.
///
/// A `None` reason leaves the previous reason in place so the last real
/// failure stays visible through transient status updates.
pub async fn update_status(
    db: &Database,
    id: &str,
    status: &str,
    reason: Option<&str>,
) -> Result<(), ZapgateError> {
    let id = id.to_string();
    let status = status.to_string();
    let reason = reason.map(|r| r.to_string());
    db.connection()
        .call(move |conn| {
            match reason {
                Some(reason) => {
                    conn.execute(
                        "UPDATE instances
                         SET connection_status = ?1, last_disconnect_reason = ?2
                         WHERE id = ?3",
                        params![status, reason, id],
                    )?;
                }
                None => {
                    conn.execute(
                        "UPDATE instances SET connection_status = ?1 WHERE id = ?2",
                        params![status, id],
                    )?;
                }
            }
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Record a successful connection: status, timestamp, and phone id.
pub async fn record_connection(
    db: &Database,
    id: &str,
    phone: Option<&str>,
) -> Result<(), ZapgateError> {
    let id = id.to_string();
    let phone = phone.map(|p| p.to_string());
    db.connection()
        .call(move |conn| {
            conn.execute(
                "UPDATE instances
                 SET connection_status = 'CONNECTED',
                     last_connection_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                     phone = COALESCE(?1, phone)
                 WHERE id = ?2",
                params![phone, id],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Persist the reconnect attempt counter.
pub async fn set_reconnect_attempts(
    db: &Database,
    id: &str,
    attempts: u32,
) -> Result<(), ZapgateError> {
    let id = id.to_string();
    db.connection()
        .call(move |conn| {
            conn.execute(
                "UPDATE instances SET reconnect_attempts = ?1 WHERE id = ?2",
                params![attempts as i64, id],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_db() -> (Database, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        (db, dir)
    }

    fn make_record(id: &str) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            name: format!("Instance {id}"),
            webhook_url: Some("https://example.com/hook".to_string()),
            sistema_url: None,
            api_token: Some("tok-123".to_string()),
            phone: None,
            enabled: true,
            connection_status: "DISCONNECTED".to_string(),
            last_connection_at: None,
            last_disconnect_reason: None,
            reconnect_attempts: 0,
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_and_get_round_trips() {
        let (db, _dir) = setup_db().await;
        upsert_instance(&db, &make_record("a")).await.unwrap();

        let got = get_instance(&db, "a").await.unwrap().unwrap();
        assert_eq!(got.id, "a");
        assert_eq!(got.api_token.as_deref(), Some("tok-123"));
        assert!(got.enabled);
        assert_eq!(got.connection_status, "DISCONNECTED");

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let (db, _dir) = setup_db().await;
        assert!(get_instance(&db, "nope").await.unwrap().is_none());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn list_enabled_filters_intent() {
        let (db, _dir) = setup_db().await;
        upsert_instance(&db, &make_record("a")).await.unwrap();
        let mut b = make_record("b");
        b.enabled = false;
        upsert_instance(&db, &b).await.unwrap();

        let enabled = list_enabled(&db).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "a");

        let all = list_instances(&db).await.unwrap();
        assert_eq!(all.len(), 2);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn set_enabled_toggles_intent() {
        let (db, _dir) = setup_db().await;
        upsert_instance(&db, &make_record("a")).await.unwrap();

        set_enabled(&db, "a", false).await.unwrap();
        assert!(!get_instance(&db, "a").await.unwrap().unwrap().enabled);

        set_enabled(&db, "a", true).await.unwrap();
        assert!(get_instance(&db, "a").await.unwrap().unwrap().enabled);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn update_status_keeps_old_reason_when_none() {
        let (db, _dir) = setup_db().await;
        upsert_instance(&db, &make_record("a")).await.unwrap();

        update_status(&db, "a", "DISCONNECTED", Some("NETWORK_ERROR"))
            .await
            .unwrap();
        update_status(&db, "a", "RECONNECTING", None).await.unwrap();

        let got = get_instance(&db, "a").await.unwrap().unwrap();
        assert_eq!(got.connection_status, "RECONNECTING");
        assert_eq!(got.last_disconnect_reason.as_deref(), Some("NETWORK_ERROR"));

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn record_connection_stamps_phone_and_time() {
        let (db, _dir) = setup_db().await;
        upsert_instance(&db, &make_record("a")).await.unwrap();

        record_connection(&db, "a", Some("5511999887766")).await.unwrap();

        let got = get_instance(&db, "a").await.unwrap().unwrap();
        assert_eq!(got.connection_status, "CONNECTED");
        assert_eq!(got.phone.as_deref(), Some("5511999887766"));
        assert!(got.last_connection_at.is_some());

        // A reconnect without phone info keeps the known phone.
        record_connection(&db, "a", None).await.unwrap();
        let got = get_instance(&db, "a").await.unwrap().unwrap();
        assert_eq!(got.phone.as_deref(), Some("5511999887766"));

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_attempts_persist() {
        let (db, _dir) = setup_db().await;
        upsert_instance(&db, &make_record("a")).await.unwrap();

        set_reconnect_attempts(&db, "a", 7).await.unwrap();
        let got = get_instance(&db, "a").await.unwrap().unwrap();
        assert_eq!(got.reconnect_attempts, 7);

        db.close().await.unwrap();
    }
}
