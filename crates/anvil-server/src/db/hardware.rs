//! Hardware store: opaque JSON documents with indexed MAC/IP lookup keys.

use super::{constraint_err, db_err, now, parse_opt_ts, parse_ts, Db};
use anvil_common::models::Hardware;
use anvil_common::net::{is_ip, is_mac, normalize_mac};
use anvil_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeSet;

impl Db {
    /// Insert or update a hardware record. The document must carry a
    /// top-level string `id` and at least one MAC or IP somewhere in its
    /// body; pushing an existing id replaces the document and revives a
    /// tombstoned record.
    pub async fn push_hardware(&self, data: serde_json::Value) -> Result<Hardware> {
        let id = data
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::InvalidArgument("hardware document requires a string id".to_string())
            })?
            .to_string();

        let keys = extract_keys(&data);
        if keys.is_empty() {
            return Err(Error::InvalidArgument(
                "hardware document must contain at least one MAC or IP address".to_string(),
            ));
        }

        let json = serde_json::to_string(&data)
            .map_err(|e| Error::InvalidArgument(format!("unserializable hardware data: {}", e)))?;
        let ts = now();

        let mut tx = self.pool().begin().await.map_err(db_err)?;
        sqlx::query(
            "INSERT INTO hardware (id, data, created_at, updated_at, deleted_at) \
             VALUES (?, ?, ?, ?, NULL) \
             ON CONFLICT(id) DO UPDATE SET \
             data = excluded.data, updated_at = excluded.updated_at, deleted_at = NULL",
        )
        .bind(&id)
        .bind(&json)
        .bind(&ts)
        .bind(&ts)
        .execute(&mut *tx)
        .await
        .map_err(|e| constraint_err(e, "hardware"))?;

        sqlx::query("DELETE FROM hardware_keys WHERE hardware_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for (kind, value) in &keys {
            sqlx::query("INSERT INTO hardware_keys (hardware_id, kind, value) VALUES (?, ?, ?)")
                .bind(&id)
                .bind(kind)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        self.hardware_by_id(&id).await
    }

    /// Lookup by id. Tombstoned records still resolve so historical
    /// workflows can name the machine that ran them.
    pub async fn hardware_by_id(&self, id: &str) -> Result<Hardware> {
        let row = sqlx::query("SELECT * FROM hardware WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.map(row_to_hardware)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("hardware {}", id)))
    }

    pub async fn hardware_by_mac(&self, mac: &str) -> Result<Hardware> {
        self.hardware_by_key("mac", &normalize_mac(mac)).await
    }

    pub async fn hardware_by_ip(&self, ip: &str) -> Result<Hardware> {
        self.hardware_by_key("ip", ip).await
    }

    async fn hardware_by_key(&self, kind: &str, value: &str) -> Result<Hardware> {
        let row = sqlx::query(
            "SELECT h.* FROM hardware h \
             JOIN hardware_keys k ON k.hardware_id = h.id \
             WHERE k.kind = ? AND k.value = ? AND h.deleted_at IS NULL \
             LIMIT 1",
        )
        .bind(kind)
        .bind(value)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        row.map(row_to_hardware)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("hardware with {} {}", kind, value)))
    }

    pub async fn list_hardware(&self) -> Result<Vec<Hardware>> {
        let rows = sqlx::query(
            "SELECT * FROM hardware WHERE deleted_at IS NULL ORDER BY created_at, id",
        )
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(row_to_hardware).collect()
    }

    /// Soft-delete. The lookup keys are dropped so the MAC/IP can be
    /// reused by a replacement machine, but the record itself remains.
    pub async fn delete_hardware(&self, id: &str) -> Result<()> {
        let ts = now();
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        let result = sqlx::query(
            "UPDATE hardware SET deleted_at = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&ts)
        .bind(&ts)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("hardware {}", id)));
        }
        sqlx::query("DELETE FROM hardware_keys WHERE hardware_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

/// Collect every MAC and IP string found anywhere in the document.
fn extract_keys(data: &serde_json::Value) -> Vec<(String, String)> {
    let mut keys = BTreeSet::new();
    walk(data, &mut keys);
    keys.into_iter().collect()
}

fn walk(value: &serde_json::Value, out: &mut BTreeSet<(String, String)>) {
    match value {
        serde_json::Value::String(s) => {
            if is_mac(s) {
                out.insert(("mac".to_string(), normalize_mac(s)));
            } else if is_ip(s) {
                out.insert(("ip".to_string(), s.clone()));
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                walk(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for child in map.values() {
                walk(child, out);
            }
        }
        _ => {}
    }
}

fn row_to_hardware(row: SqliteRow) -> Result<Hardware> {
    let data: String = row.get("data");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let deleted_at: Option<String> = row.get("deleted_at");
    Ok(Hardware {
        id: row.get("id"),
        data: serde_json::from_str(&data)
            .map_err(|e| Error::Internal(format!("bad hardware json: {}", e)))?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        deleted_at: parse_opt_ts(deleted_at)?,
    })
}
