use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use shared_types::{InstanceRecord, TrackInstance};

use super::{from_micros, to_micros, StoreError};

fn from_row(row: &SqliteRow) -> Result<InstanceRecord, StoreError> {
    Ok(InstanceRecord {
        environment_id: row.try_get("environment_id")?,
        instance_id: row.try_get("instance_id")?,
        instance_type: row.try_get("instance_type")?,
        type_name: row.try_get("type_name")?,
        type_title: row.try_get("type_title")?,
        unit_count: row.try_get("unit_count")?,
        created: from_micros(row.try_get("created")?)?,
        updated: from_micros(row.try_get("updated")?)?,
    })
}

/// Insert or refresh the stats row for (instance, environment).
/// A repeat track keeps the original `created` timestamp.
pub async fn upsert(conn: &mut SqliteConnection, instance: &TrackInstance) -> Result<(), StoreError> {
    let now = to_micros(chrono::Utc::now());
    sqlx::query(
        r#"
        INSERT INTO instance_stats
            (instance_id, environment_id, instance_type, type_name, type_title, unit_count, created, updated)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (instance_id, environment_id) DO UPDATE SET
            instance_type = excluded.instance_type,
            type_name     = excluded.type_name,
            type_title    = excluded.type_title,
            unit_count    = excluded.unit_count,
            updated       = excluded.updated
        "#,
    )
    .bind(&instance.instance)
    .bind(&instance.environment)
    .bind(instance.instance_type)
    .bind(&instance.type_name)
    .bind(&instance.type_title)
    .bind(instance.unit_count)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn remove(
    conn: &mut SqliteConnection,
    instance_id: &str,
    environment_id: &str,
) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM instance_stats WHERE instance_id = ? AND environment_id = ?")
        .bind(instance_id)
        .bind(environment_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get(
    conn: &mut SqliteConnection,
    instance_id: &str,
    environment_id: &str,
) -> Result<Option<InstanceRecord>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT instance_id, environment_id, instance_type, type_name, type_title, unit_count, created, updated
        FROM instance_stats
        WHERE instance_id = ? AND environment_id = ?
        "#,
    )
    .bind(instance_id)
    .bind(environment_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(from_row).transpose()
}
