use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use shared_types::{Session, SessionState};

use super::{from_micros, to_micros, StoreError};

fn from_row(row: &SqliteRow) -> Result<Session, StoreError> {
    Ok(Session {
        id: row.try_get("id")?,
        environment_id: row.try_get("environment_id")?,
        user_id: row.try_get("user_id")?,
        state: row.try_get::<String, _>("state")?.parse()?,
        version: row.try_get("version")?,
        created: from_micros(row.try_get("created")?)?,
        updated: from_micros(row.try_get("updated")?)?,
    })
}

pub async fn insert(conn: &mut SqliteConnection, session: &Session) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO sessions (id, environment_id, user_id, state, version, created, updated)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(&session.environment_id)
    .bind(&session.user_id)
    .bind(session.state.as_str())
    .bind(session.version)
    .bind(to_micros(session.created))
    .bind(to_micros(session.updated))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Option<Session>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, environment_id, user_id, state, version, created, updated
        FROM sessions
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(from_row).transpose()
}

pub async fn find_by_state(
    conn: &mut SqliteConnection,
    environment_id: &str,
    state: SessionState,
) -> Result<Option<Session>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, environment_id, user_id, state, version, created, updated
        FROM sessions
        WHERE environment_id = ? AND state = ?
        ORDER BY created ASC
        LIMIT 1
        "#,
    )
    .bind(environment_id)
    .bind(state.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(from_row).transpose()
}

/// Move a session to `to`, but only if it is currently in `from`.
/// Returns whether a row changed. Entering `deploying` while another session
/// of the environment is deploying fails with [`StoreError::Conflict`].
pub async fn transition(
    conn: &mut SqliteConnection,
    id: &str,
    from: SessionState,
    to: SessionState,
) -> Result<bool, StoreError> {
    let result = sqlx::query("UPDATE sessions SET state = ?, updated = ? WHERE id = ? AND state = ?")
        .bind(to.as_str())
        .bind(to_micros(chrono::Utc::now()))
        .bind(id)
        .bind(from.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}
