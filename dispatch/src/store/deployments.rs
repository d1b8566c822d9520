use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use shared_types::{Deployment, Status, StatusLevel};

use super::{from_micros, to_micros, StoreError};

fn deployment_from_row(row: &SqliteRow) -> Result<Deployment, StoreError> {
    Ok(Deployment {
        id: row.try_get("id")?,
        environment_id: row.try_get("environment_id")?,
        description: serde_json::from_str(&row.try_get::<String, _>("description")?)?,
        started: from_micros(row.try_get("started")?)?,
        finished: row
            .try_get::<Option<i64>, _>("finished")?
            .map(from_micros)
            .transpose()?,
    })
}

fn status_from_row(row: &SqliteRow) -> Result<Status, StoreError> {
    Ok(Status {
        id: row.try_get("id")?,
        deployment_id: row.try_get("deployment_id")?,
        entity_id: row.try_get("entity_id")?,
        entity: row.try_get("entity")?,
        level: row.try_get::<String, _>("level")?.parse()?,
        text: row.try_get("text")?,
        details: row.try_get("details")?,
        attributes: serde_json::from_str(&row.try_get::<String, _>("attributes")?)?,
        timestamp: from_micros(row.try_get("timestamp")?)?,
    })
}

pub async fn insert(conn: &mut SqliteConnection, deployment: &Deployment) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO deployments (id, environment_id, description, started, finished)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&deployment.id)
    .bind(&deployment.environment_id)
    .bind(serde_json::to_string(&deployment.description)?)
    .bind(to_micros(deployment.started))
    .bind(deployment.finished.map(to_micros))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Delete a deployment that was never handed to the executor. Its statuses
/// go with it. Returns whether a row was removed.
pub async fn remove(conn: &mut SqliteConnection, id: &str) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM deployments WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Option<Deployment>, StoreError> {
    let row = sqlx::query(
        "SELECT id, environment_id, description, started, finished FROM deployments WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(deployment_from_row).transpose()
}

/// Most recently started deployment of an environment
pub async fn latest_for_environment(
    conn: &mut SqliteConnection,
    environment_id: &str,
) -> Result<Option<Deployment>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, environment_id, description, started, finished
        FROM deployments
        WHERE environment_id = ?
        ORDER BY started DESC, rowid DESC
        LIMIT 1
        "#,
    )
    .bind(environment_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(deployment_from_row).transpose()
}

/// Set `finished` unless it is already set. Returns whether this call set it.
pub async fn mark_finished(
    conn: &mut SqliteConnection,
    id: &str,
    finished: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let result =
        sqlx::query("UPDATE deployments SET finished = ? WHERE id = ? AND finished IS NULL")
            .bind(to_micros(finished))
            .bind(id)
            .execute(&mut *conn)
            .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn insert_status(conn: &mut SqliteConnection, status: &Status) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO statuses (id, deployment_id, entity_id, entity, level, text, details, attributes, timestamp)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&status.id)
    .bind(&status.deployment_id)
    .bind(&status.entity_id)
    .bind(&status.entity)
    .bind(status.level.as_str())
    .bind(&status.text)
    .bind(&status.details)
    .bind(serde_json::to_string(&status.attributes)?)
    .bind(to_micros(status.timestamp))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Statuses of a deployment in the order they were recorded
pub async fn statuses(
    conn: &mut SqliteConnection,
    deployment_id: &str,
) -> Result<Vec<Status>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, deployment_id, entity_id, entity, level, text, details, attributes, timestamp
        FROM statuses
        WHERE deployment_id = ?
        ORDER BY seq ASC
        "#,
    )
    .bind(deployment_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(status_from_row).collect()
}

pub async fn count_statuses(
    conn: &mut SqliteConnection,
    deployment_id: &str,
    level: StatusLevel,
) -> Result<i64, StoreError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM statuses WHERE deployment_id = ? AND level = ?",
    )
    .bind(deployment_id)
    .bind(level.as_str())
    .fetch_one(&mut *conn)
    .await?;

    Ok(count)
}
