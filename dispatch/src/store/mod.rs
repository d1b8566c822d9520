//! Persistence store - SQLite via sqlx
//!
//! Each aggregate has its own module of free functions taking
//! `&mut SqliteConnection`, so callers can run them on a pooled connection
//! or inside a transaction they own. [`Store`] wraps the pool and offers
//! single-call conveniences over the same functions.
//!
//! Timestamps are stored as integer microseconds since the epoch so that
//! `ORDER BY` matches chronological order.

pub mod categories;
pub mod deployments;
pub mod environments;
pub mod instances;
pub mod sessions;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};

use shared_types::{
    Category, Deployment, Environment, InstanceRecord, Session, SessionState, Status,
    StatusLevel, TrackInstance,
};

/// Errors that can occur in the store
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<shared_types::PayloadError> for StoreError {
    fn from(e: shared_types::PayloadError) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {micros}")))
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS environments (
        id          TEXT    PRIMARY KEY,
        name        TEXT    NOT NULL,
        tenant_id   TEXT,
        description TEXT    NOT NULL,
        networking  TEXT    NOT NULL,
        version     INTEGER NOT NULL DEFAULT 0,
        created     INTEGER NOT NULL,
        updated     INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id             TEXT    PRIMARY KEY,
        environment_id TEXT    NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
        user_id        TEXT    NOT NULL,
        state          TEXT    NOT NULL,
        version        INTEGER NOT NULL,
        created        INTEGER NOT NULL,
        updated        INTEGER NOT NULL
    )
    "#,
    // At most one deploying session per environment.
    "CREATE UNIQUE INDEX IF NOT EXISTS sessions_one_deploying ON sessions (environment_id) WHERE state = 'deploying'",
    r#"
    CREATE TABLE IF NOT EXISTS deployments (
        id             TEXT    PRIMARY KEY,
        environment_id TEXT    NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
        description    TEXT    NOT NULL,
        started        INTEGER NOT NULL,
        finished       INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS deployments_env_started ON deployments (environment_id, started DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS statuses (
        seq           INTEGER PRIMARY KEY AUTOINCREMENT,
        id            TEXT    UNIQUE NOT NULL,
        deployment_id TEXT    NOT NULL REFERENCES deployments(id) ON DELETE CASCADE,
        entity_id     TEXT,
        entity        TEXT,
        level         TEXT    NOT NULL,
        text          TEXT    NOT NULL,
        details       TEXT,
        attributes    TEXT    NOT NULL DEFAULT '{}',
        timestamp     INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS statuses_deployment_level ON statuses (deployment_id, level)",
    r#"
    CREATE TABLE IF NOT EXISTS instance_stats (
        instance_id    TEXT    NOT NULL,
        environment_id TEXT    NOT NULL,
        instance_type  INTEGER NOT NULL DEFAULT 0,
        type_name      TEXT    NOT NULL,
        type_title     TEXT,
        unit_count     INTEGER,
        created        INTEGER NOT NULL,
        updated        INTEGER NOT NULL,
        PRIMARY KEY (instance_id, environment_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS categories (
        id   TEXT PRIMARY KEY,
        name TEXT UNIQUE NOT NULL
    )
    "#,
];

/// Pool-backed handle to the deployment database
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) a file database. Accepts both
    /// `sqlite:./foo.db` and bare paths.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        if database_url == "sqlite::memory:" || database_url == ":memory:" {
            return Self::in_memory().await;
        }

        let file_path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
        let path = std::path::Path::new(file_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Database(format!("create {}: {e}", parent.display())))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        tracing::info!(database_path = %path.display(), "Opened deployment database");
        Ok(Self::new(pool))
    }

    /// Private in-memory database, schema applied. One connection only:
    /// every pooled connection would otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!(statements = SCHEMA.len(), "Schema is up to date");
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    // ------------------------------------------------------------------------
    // Environments
    // ------------------------------------------------------------------------

    pub async fn create_environment(&self, environment: &Environment) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        environments::insert(&mut conn, environment).await
    }

    pub async fn get_environment(&self, id: &str) -> Result<Option<Environment>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        environments::get(&mut conn, id).await
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    pub async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        sessions::insert(&mut conn, session).await
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        sessions::get(&mut conn, id).await
    }

    pub async fn find_session(
        &self,
        environment_id: &str,
        state: SessionState,
    ) -> Result<Option<Session>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        sessions::find_by_state(&mut conn, environment_id, state).await
    }

    // ------------------------------------------------------------------------
    // Deployments & statuses
    // ------------------------------------------------------------------------

    pub async fn create_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        deployments::insert(&mut conn, deployment).await
    }

    pub async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        deployments::get(&mut conn, id).await
    }

    pub async fn latest_deployment(
        &self,
        environment_id: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        deployments::latest_for_environment(&mut conn, environment_id).await
    }

    pub async fn add_status(&self, status: &Status) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        deployments::insert_status(&mut conn, status).await
    }

    pub async fn statuses(&self, deployment_id: &str) -> Result<Vec<Status>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        deployments::statuses(&mut conn, deployment_id).await
    }

    pub async fn count_statuses(
        &self,
        deployment_id: &str,
        level: StatusLevel,
    ) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        deployments::count_statuses(&mut conn, deployment_id, level).await
    }

    // ------------------------------------------------------------------------
    // Instance stats
    // ------------------------------------------------------------------------

    pub async fn track_instance(&self, instance: &TrackInstance) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        instances::upsert(&mut conn, instance).await
    }

    pub async fn destroy_instance(
        &self,
        instance_id: &str,
        environment_id: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        instances::remove(&mut conn, instance_id, environment_id).await
    }

    pub async fn get_instance(
        &self,
        instance_id: &str,
        environment_id: &str,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        instances::get(&mut conn, instance_id, environment_id).await
    }

    // ------------------------------------------------------------------------
    // Categories
    // ------------------------------------------------------------------------

    pub async fn add_category(&self, name: &str) -> Result<Category, StoreError> {
        let mut conn = self.pool.acquire().await?;
        categories::add(&mut conn, name).await
    }

    pub async fn category_names(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        categories::names(&mut conn).await
    }
}
