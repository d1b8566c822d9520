use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use shared_types::Environment;

use super::{from_micros, to_micros, StoreError};

fn from_row(row: &SqliteRow) -> Result<Environment, StoreError> {
    Ok(Environment {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        tenant_id: row.try_get("tenant_id")?,
        description: serde_json::from_str(&row.try_get::<String, _>("description")?)?,
        networking: serde_json::from_str(&row.try_get::<String, _>("networking")?)?,
        version: row.try_get("version")?,
        created: from_micros(row.try_get("created")?)?,
        updated: from_micros(row.try_get("updated")?)?,
    })
}

pub async fn insert(conn: &mut SqliteConnection, env: &Environment) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO environments (id, name, tenant_id, description, networking, version, created, updated)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&env.id)
    .bind(&env.name)
    .bind(&env.tenant_id)
    .bind(serde_json::to_string(&env.description)?)
    .bind(serde_json::to_string(&env.networking)?)
    .bind(env.version)
    .bind(to_micros(env.created))
    .bind(to_micros(env.updated))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Option<Environment>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, name, tenant_id, description, networking, version, created, updated
        FROM environments
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(from_row).transpose()
}

/// Replace the reported topology and bump the version by one.
/// Returns the new version, or `None` when the environment is gone.
pub async fn apply_result(
    conn: &mut SqliteConnection,
    id: &str,
    description: &Value,
    networking: &Value,
) -> Result<Option<i64>, StoreError> {
    let version = sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE environments
        SET description = ?, networking = ?, version = version + 1, updated = ?
        WHERE id = ?
        RETURNING version
        "#,
    )
    .bind(serde_json::to_string(description)?)
    .bind(serde_json::to_string(networking)?)
    .bind(to_micros(chrono::Utc::now()))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(version)
}
