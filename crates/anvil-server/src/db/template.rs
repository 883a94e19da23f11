//! Template store: versioned YAML documents, validated before they land.

use super::{constraint_err, db_err, now, parse_opt_ts, parse_ts, uuid_from_bytes, Db};
use anvil_common::models::Template;
use anvil_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

impl Db {
    /// Create a template. The body is parsed and validated first so a
    /// broken document can never be instantiated later.
    pub async fn create_template(&self, name: &str, data: &str) -> Result<Template> {
        if name.is_empty() || name.len() >= 200 {
            return Err(Error::InvalidArgument(
                "template name must be non-empty and shorter than 200 characters".to_string(),
            ));
        }
        anvil_template::parse(data).map_err(|e| Error::Parse(e.to_string()))?;

        let id = Uuid::new_v4();
        let ts = now();
        sqlx::query(
            "INSERT INTO templates (id, name, data, created_at, updated_at, deleted_at) \
             VALUES (?, ?, ?, ?, ?, NULL)",
        )
        .bind(id.as_bytes().to_vec())
        .bind(name)
        .bind(data)
        .bind(&ts)
        .bind(&ts)
        .execute(self.pool())
        .await
        .map_err(|e| constraint_err(e, &format!("template {}", name)))?;

        self.get_template(&id.to_string(), false).await
    }

    /// Fetch by UUID or by name, whichever the key parses as.
    pub async fn get_template(&self, key: &str, include_deleted: bool) -> Result<Template> {
        let row = match Uuid::parse_str(key) {
            Ok(id) => {
                sqlx::query(
                    "SELECT * FROM templates WHERE id = ? AND (deleted_at IS NULL OR ?)",
                )
                .bind(id.as_bytes().to_vec())
                .bind(include_deleted)
                .fetch_optional(self.pool())
                .await
            }
            Err(_) => {
                sqlx::query(
                    "SELECT * FROM templates WHERE name = ? AND (deleted_at IS NULL OR ?) \
                     ORDER BY created_at DESC LIMIT 1",
                )
                .bind(key)
                .bind(include_deleted)
                .fetch_optional(self.pool())
                .await
            }
        }
        .map_err(db_err)?;

        row.map(row_to_template)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("template {}", key)))
    }

    /// Replace the body of a live template; the new body is re-validated.
    pub async fn update_template(&self, id: Uuid, data: &str) -> Result<Template> {
        anvil_template::parse(data).map_err(|e| Error::Parse(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE templates SET data = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(data)
        .bind(now())
        .bind(id.as_bytes().to_vec())
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("template {}", id)));
        }
        self.get_template(&id.to_string(), false).await
    }

    pub async fn delete_template(&self, name: &str) -> Result<()> {
        let ts = now();
        let result = sqlx::query(
            "UPDATE templates SET deleted_at = ?, updated_at = ? \
             WHERE name = ? AND deleted_at IS NULL",
        )
        .bind(&ts)
        .bind(&ts)
        .bind(name)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("template {}", name)));
        }
        Ok(())
    }

    /// List live templates, optionally filtered by a name substring.
    pub async fn list_templates(&self, filter: Option<&str>) -> Result<Vec<Template>> {
        let pattern = format!("%{}%", filter.unwrap_or(""));
        let rows = sqlx::query(
            "SELECT * FROM templates WHERE deleted_at IS NULL AND name LIKE ? \
             ORDER BY created_at, name",
        )
        .bind(&pattern)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(row_to_template).collect()
    }
}

fn row_to_template(row: SqliteRow) -> Result<Template> {
    let id: Vec<u8> = row.get("id");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let deleted_at: Option<String> = row.get("deleted_at");
    Ok(Template {
        id: uuid_from_bytes(&id)?,
        name: row.get("name"),
        data: row.get("data"),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        deleted_at: parse_opt_ts(deleted_at)?,
    })
}
