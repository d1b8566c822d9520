//! Shared types between the dispatch service and the manage CLI
//!
//! These types cover:
//! - The persisted deployment model (environments, sessions, deployments, statuses)
//! - The payload shapes that travel over the message bus (results, notifications)
//!
//! Serializable with serde for JSON over the bus.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event types emitted by the executor are namespaced with this prefix.
pub const EVENT_TYPE_PREFIX: &str = "murano.";

/// Correlation field an agent stamps on its execution result.
pub const SOURCE_ID_FIELD: &str = "SourceID";

// ============================================================================
// Payload Errors
// ============================================================================

/// Errors raised while reading bus payloads
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

// ============================================================================
// Deployment Model
// ============================================================================

/// A deployed application topology and its live configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub tenant_id: Option<String>,
    /// Object graph of the deployed topology, as last reported by the executor
    pub description: Value,
    pub networking: Value,
    /// Bumped once per reconciled result
    pub version: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Environment {
    pub fn new(name: impl Into<String>, tenant_id: Option<String>) -> Self {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            description: serde_json::json!({ "Objects": { "?": { "id": id.clone() } } }),
            id,
            name: name.into(),
            tenant_id,
            networking: Value::Object(Map::new()),
            version: 0,
            created: now,
            updated: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Deploying,
    Deployed,
    DeployFailure,
    Deleting,
    DeleteFailure,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Deploying => "deploying",
            SessionState::Deployed => "deployed",
            SessionState::DeployFailure => "deploy failure",
            SessionState::Deleting => "deleting",
            SessionState::DeleteFailure => "delete failure",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(SessionState::Open),
            "deploying" => Ok(SessionState::Deploying),
            "deployed" => Ok(SessionState::Deployed),
            "deploy failure" => Ok(SessionState::DeployFailure),
            "deleting" => Ok(SessionState::Deleting),
            "delete failure" => Ok(SessionState::DeleteFailure),
            other => Err(PayloadError::InvalidField {
                field: "state".to_string(),
                reason: format!("unknown session state '{other}'"),
            }),
        }
    }
}

/// A draft of changes bound to one environment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub environment_id: String,
    pub user_id: String,
    pub state: SessionState,
    /// Environment version the session was opened against
    pub version: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Session {
    pub fn open(environment: &Environment, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            environment_id: environment.id.clone(),
            user_id: user_id.into(),
            state: SessionState::Open,
            version: environment.version,
            created: now,
            updated: now,
        }
    }
}

/// One execution of a session's changes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: String,
    pub environment_id: String,
    /// Snapshot of the object graph handed to the executor
    pub description: Value,
    pub started: DateTime<Utc>,
    /// Set once, after the closing status is recorded
    pub finished: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn start(environment_id: impl Into<String>, description: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            environment_id: environment_id.into(),
            description,
            started: Utc::now(),
            finished: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

impl StatusLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusLevel::Info => "info",
            StatusLevel::Warning => "warning",
            StatusLevel::Error => "error",
        }
    }
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusLevel {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(StatusLevel::Info),
            "warning" => Ok(StatusLevel::Warning),
            "error" => Ok(StatusLevel::Error),
            other => Err(PayloadError::InvalidField {
                field: "level".to_string(),
                reason: format!("unknown status level '{other}'"),
            }),
        }
    }
}

/// Append-only timeline entry of a deployment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub id: String,
    pub deployment_id: String,
    pub entity_id: Option<String>,
    pub entity: Option<String>,
    pub level: StatusLevel,
    pub text: String,
    pub details: Option<String>,
    /// Report fields with no dedicated column
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Status {
    pub fn new(deployment_id: impl Into<String>, level: StatusLevel, text: impl Into<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            deployment_id: deployment_id.into(),
            entity_id: None,
            entity: None,
            level,
            text: text.into(),
            details: None,
            attributes: Map::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Stats row for a tracked application instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub environment_id: String,
    pub instance_id: String,
    pub instance_type: i64,
    pub type_name: String,
    pub type_title: Option<String>,
    pub unit_count: Option<i64>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Package category
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub id: String,
    pub name: String,
}

// ============================================================================
// Result Payloads
// ============================================================================

/// Environment id from the root object of an executor result (`Objects.?.id`).
pub fn result_environment_id(result: &Value) -> Result<&str, PayloadError> {
    result
        .get("Objects")
        .and_then(|objects| objects.get("?"))
        .and_then(|meta| meta.get("id"))
        .and_then(Value::as_str)
        .ok_or_else(|| PayloadError::MissingField("Objects.?.id".to_string()))
}

/// Whether the executor marked the environment as torn down.
pub fn result_is_deleted(result: &Value) -> bool {
    result.get("deleted").is_some()
}

/// Turn a result into the persisted description: `Objects.applications`
/// moves to `Objects.services` (empty list when absent).
pub fn result_into_description(mut result: Value) -> Value {
    if let Some(objects) = result.get_mut("Objects").and_then(Value::as_object_mut) {
        let services = objects
            .remove("applications")
            .unwrap_or_else(|| Value::Array(Vec::new()));
        objects.insert("services".to_string(), services);
    }
    result
}

/// Networking section of a result, `{}` when absent.
pub fn result_networking(result: &Value) -> Value {
    result
        .get("networking")
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()))
}

// ============================================================================
// Notifications
// ============================================================================

/// Notification priorities, as carried on the bus
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Audit,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
    Sample,
}

/// Out-of-band notification envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub priority: Priority,
    #[serde(default)]
    pub publisher_id: String,
    pub event_type: String,
    pub payload: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl Notification {
    pub fn new(priority: Priority, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            priority,
            publisher_id: String::new(),
            event_type: event_type.into(),
            payload,
            metadata: Value::Null,
        }
    }
}

/// `track_instance` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackInstance {
    pub instance: String,
    pub environment: String,
    #[serde(default)]
    pub instance_type: i64,
    #[serde(default)]
    pub unit_count: Option<i64>,
    pub type_name: String,
    #[serde(default)]
    pub type_title: Option<String>,
}

/// `untrack_instance` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UntrackInstance {
    pub instance: String,
    pub environment: String,
}

/// `report_notification` payload, split into known status fields and the rest
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub entity_id: String,
    pub environment_id: String,
    pub entity: Option<String>,
    pub level: StatusLevel,
    pub text: String,
    pub details: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub attributes: Map<String, Value>,
}

impl StatusReport {
    pub fn from_payload(payload: &Value) -> Result<Self, PayloadError> {
        let mut fields = payload
            .as_object()
            .cloned()
            .ok_or_else(|| PayloadError::InvalidField {
                field: "payload".to_string(),
                reason: "expected an object".to_string(),
            })?;

        let entity_id = take_id(&mut fields, "id")?;
        let environment_id = take_id(&mut fields, "environment_id")?;
        let entity = take_text(&mut fields, "entity");
        let text = take_text(&mut fields, "text").unwrap_or_default();
        let details = take_text(&mut fields, "details");
        let level = match take_text(&mut fields, "level") {
            Some(level) => level.parse()?,
            None => StatusLevel::Info,
        };
        // Unparseable timestamps stay on the report as a plain attribute.
        let timestamp = match fields.remove("timestamp") {
            Some(Value::String(raw)) => match parse_report_timestamp(&raw) {
                Some(ts) => Some(ts),
                None => {
                    fields.insert("timestamp".to_string(), Value::String(raw));
                    None
                }
            },
            Some(Value::Null) | None => None,
            Some(other) => {
                fields.insert("timestamp".to_string(), other);
                None
            }
        };

        Ok(Self {
            entity_id,
            environment_id,
            entity,
            level,
            text,
            details,
            timestamp,
            attributes: fields,
        })
    }

    pub fn into_status(self, deployment_id: impl Into<String>) -> Status {
        let mut status = Status::new(deployment_id, self.level, self.text);
        status.entity_id = Some(self.entity_id);
        status.entity = self.entity;
        status.details = self.details;
        status.attributes = self.attributes;
        if let Some(timestamp) = self.timestamp {
            status.timestamp = timestamp;
        }
        status
    }
}

/// RFC 3339, or a naive `%Y-%m-%dT%H:%M:%S%.f` time taken as UTC.
fn parse_report_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn take_id(fields: &mut Map<String, Value>, key: &str) -> Result<String, PayloadError> {
    match fields.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Null) | None => Err(PayloadError::MissingField(key.to_string())),
        Some(other) => Err(PayloadError::InvalidField {
            field: key.to_string(),
            reason: format!("expected a string id, got {other}"),
        }),
    }
}

fn take_text(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}
