//! Notification router - demultiplexes executor progress notifications
//!
//! Handlers are looked up in a table keyed by `(priority, event_type)`, built
//! once when the router is created. A handler registered as `name` at
//! priority `p` is reached only by notifications with that priority and an
//! event type of exactly `murano.<name>`. Anything else is ignored.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use shared_types::{
    Notification, PayloadError, Priority, Status, StatusReport, TrackInstance, UntrackInstance,
    EVENT_TYPE_PREFIX,
};

use crate::store::{deployments, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationHandler {
    TrackInstance,
    UntrackInstance,
    ReportNotification,
}

impl NotificationHandler {
    pub const ALL: [NotificationHandler; 3] = [
        NotificationHandler::TrackInstance,
        NotificationHandler::UntrackInstance,
        NotificationHandler::ReportNotification,
    ];

    /// Logical name; the event type is this name with the `murano.` prefix
    pub fn name(&self) -> &'static str {
        match self {
            NotificationHandler::TrackInstance => "track_instance",
            NotificationHandler::UntrackInstance => "untrack_instance",
            NotificationHandler::ReportNotification => "report_notification",
        }
    }

    pub fn event_type(&self) -> String {
        format!("{EVENT_TYPE_PREFIX}{}", self.name())
    }
}

impl fmt::Display for NotificationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("invalid notification payload: {0}")]
    Validation(String),

    #[error("no deployment found for environment {0}")]
    NoDeployment(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl NotificationError {
    fn validation(handler: NotificationHandler, reason: impl fmt::Display) -> Self {
        NotificationError::Validation(format!("{handler}: {reason}"))
    }
}

pub struct NotificationRouter {
    store: Store,
    routes: HashMap<(Priority, String), NotificationHandler>,
}

impl NotificationRouter {
    /// Router with every handler registered at `info` priority
    pub fn new(store: Store) -> Self {
        Self::with_routes(
            store,
            NotificationHandler::ALL.map(|handler| (Priority::Info, handler)),
        )
    }

    pub fn with_routes<I>(store: Store, routes: I) -> Self
    where
        I: IntoIterator<Item = (Priority, NotificationHandler)>,
    {
        let routes = routes
            .into_iter()
            .map(|(priority, handler)| ((priority, handler.event_type()), handler))
            .collect();
        Self { store, routes }
    }

    pub fn route(&self, priority: Priority, event_type: &str) -> Option<NotificationHandler> {
        self.routes.get(&(priority, event_type.to_string())).copied()
    }

    /// Run the handler registered for this notification, if any.
    /// Returns which handler ran.
    pub async fn dispatch(
        &self,
        notification: &Notification,
    ) -> Result<Option<NotificationHandler>, NotificationError> {
        let Some(handler) = self.route(notification.priority, &notification.event_type) else {
            tracing::debug!(
                priority = ?notification.priority,
                event_type = %notification.event_type,
                "No handler for notification"
            );
            return Ok(None);
        };

        match handler {
            NotificationHandler::TrackInstance => self.track_instance(&notification.payload).await?,
            NotificationHandler::UntrackInstance => {
                self.untrack_instance(&notification.payload).await?
            }
            NotificationHandler::ReportNotification => {
                self.report_notification(&notification.payload).await?;
            }
        }
        Ok(Some(handler))
    }

    pub async fn track_instance(&self, payload: &Value) -> Result<(), NotificationError> {
        tracing::debug!(payload = %payload, "Got track instance request from orchestration engine");
        let request: TrackInstance = serde_json::from_value(payload.clone())
            .map_err(|e| NotificationError::validation(NotificationHandler::TrackInstance, e))?;

        self.store.track_instance(&request).await?;
        tracing::info!(
            instance_id = %request.instance,
            environment_id = %request.environment,
            type_name = %request.type_name,
            "Tracking instance"
        );
        Ok(())
    }

    pub async fn untrack_instance(&self, payload: &Value) -> Result<(), NotificationError> {
        tracing::debug!(payload = %payload, "Got untrack instance request from orchestration engine");
        let request: UntrackInstance = serde_json::from_value(payload.clone())
            .map_err(|e| NotificationError::validation(NotificationHandler::UntrackInstance, e))?;

        let removed = self
            .store
            .destroy_instance(&request.instance, &request.environment)
            .await?;
        tracing::info!(
            instance_id = %request.instance,
            environment_id = %request.environment,
            removed,
            "Untracked instance"
        );
        Ok(())
    }

    pub async fn report_notification(&self, payload: &Value) -> Result<Status, NotificationError> {
        tracing::debug!(payload = %payload, "Got report from orchestration engine");
        let report = StatusReport::from_payload(payload).map_err(|e: PayloadError| {
            NotificationError::validation(NotificationHandler::ReportNotification, e)
        })?;

        let mut tx = self.store.begin().await?;
        let Some(deployment) =
            deployments::latest_for_environment(&mut tx, &report.environment_id).await?
        else {
            return Err(NotificationError::NoDeployment(report.environment_id));
        };

        let status = report.into_status(deployment.id);
        deployments::insert_status(&mut tx, &status).await?;
        tx.commit().await.map_err(StoreError::from)?;

        tracing::debug!(
            deployment_id = %status.deployment_id,
            level = %status.level,
            "Recorded deployment status"
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_route_requires_prefix_and_priority() {
        let router = NotificationRouter::new(Store::in_memory().await.unwrap());

        assert_eq!(
            router.route(Priority::Info, "murano.track_instance"),
            Some(NotificationHandler::TrackInstance)
        );
        assert_eq!(
            router.route(Priority::Info, "murano.report_notification"),
            Some(NotificationHandler::ReportNotification)
        );
        assert_eq!(router.route(Priority::Warn, "murano.track_instance"), None);
        assert_eq!(router.route(Priority::Info, "track_instance"), None);
        assert_eq!(router.route(Priority::Info, "murano.other"), None);
    }

    #[tokio::test]
    async fn test_custom_route_table() {
        let router = NotificationRouter::with_routes(
            Store::in_memory().await.unwrap(),
            [(Priority::Error, NotificationHandler::ReportNotification)],
        );
        assert_eq!(
            router.route(Priority::Error, "murano.report_notification"),
            Some(NotificationHandler::ReportNotification)
        );
        assert_eq!(router.route(Priority::Info, "murano.report_notification"), None);
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(NotificationHandler::UntrackInstance.event_type(), "murano.untrack_instance");
    }
}
