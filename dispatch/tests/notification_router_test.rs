//! Notification router handlers against an in-memory store.

use serde_json::json;

use dispatch::notifications::{NotificationError, NotificationHandler, NotificationRouter};
use dispatch::store::Store;
use shared_types::{Deployment, Environment, Notification, Priority, StatusLevel};

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn store_with_deployment() -> (Store, Environment, Deployment) {
    let store = Store::in_memory().await.unwrap();
    let env = Environment::new("web", None);
    store.create_environment(&env).await.unwrap();
    let deployment = Deployment::start(&env.id, env.description.clone());
    store.create_deployment(&deployment).await.unwrap();
    (store, env, deployment)
}

fn info(event_type: &str, payload: serde_json::Value) -> Notification {
    Notification::new(Priority::Info, event_type, payload)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_track_then_untrack_instance() {
    let (store, env, _) = store_with_deployment().await;
    let router = NotificationRouter::new(store.clone());

    let handled = router
        .dispatch(&info(
            "murano.track_instance",
            json!({
                "instance": "vm-1",
                "environment": env.id,
                "type_name": "io.murano.resources.LinuxInstance",
                "type_title": "Linux",
                "unit_count": 2,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(handled, Some(NotificationHandler::TrackInstance));

    let record = store.get_instance("vm-1", &env.id).await.unwrap().unwrap();
    assert_eq!(record.type_name, "io.murano.resources.LinuxInstance");
    assert_eq!(record.unit_count, Some(2));

    // Re-tracking updates metadata and keeps the creation time
    router
        .dispatch(&info(
            "murano.track_instance",
            json!({
                "instance": "vm-1",
                "environment": env.id,
                "type_name": "io.murano.resources.LinuxInstance",
                "unit_count": 3,
            }),
        ))
        .await
        .unwrap();
    let updated = store.get_instance("vm-1", &env.id).await.unwrap().unwrap();
    assert_eq!(updated.unit_count, Some(3));
    assert_eq!(updated.created, record.created);

    let handled = router
        .dispatch(&info(
            "murano.untrack_instance",
            json!({"instance": "vm-1", "environment": env.id}),
        ))
        .await
        .unwrap();
    assert_eq!(handled, Some(NotificationHandler::UntrackInstance));
    assert!(store.get_instance("vm-1", &env.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_report_is_attached_to_latest_deployment() {
    let (store, env, deployment) = store_with_deployment().await;
    let router = NotificationRouter::new(store.clone());

    router
        .dispatch(&info(
            "murano.report_notification",
            json!({
                "id": "unit-7",
                "environment_id": env.id,
                "level": "warning",
                "text": "Disk almost full",
                "entity": "unit",
                "hostname": "node-3",
            }),
        ))
        .await
        .unwrap();

    let statuses = store.statuses(&deployment.id).await.unwrap();
    assert_eq!(statuses.len(), 1);
    let status = &statuses[0];
    assert_eq!(status.entity_id.as_deref(), Some("unit-7"));
    assert_eq!(status.entity.as_deref(), Some("unit"));
    assert_eq!(status.level, StatusLevel::Warning);
    assert_eq!(status.text, "Disk almost full");
    assert_eq!(status.attributes.get("hostname"), Some(&json!("node-3")));
    assert!(status.attributes.get("environment_id").is_none());
}

#[tokio::test]
async fn test_report_with_naive_executor_timestamp_is_stored() {
    let (store, env, deployment) = store_with_deployment().await;
    let router = NotificationRouter::new(store.clone());

    router
        .dispatch(&info(
            "murano.report_notification",
            json!({
                "id": "u1",
                "environment_id": env.id,
                "text": "Instance created",
                "timestamp": "2014-03-01T10:00:00.123456",
            }),
        ))
        .await
        .unwrap();

    let statuses = store.statuses(&deployment.id).await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(
        statuses[0].timestamp.to_rfc3339(),
        "2014-03-01T10:00:00.123456+00:00"
    );
}

#[tokio::test]
async fn test_report_without_deployment_fails() {
    let store = Store::in_memory().await.unwrap();
    let env = Environment::new("fresh", None);
    store.create_environment(&env).await.unwrap();
    let router = NotificationRouter::new(store);

    let err = router
        .report_notification(&json!({"id": "x", "environment_id": env.id, "text": "hi"}))
        .await
        .unwrap_err();
    assert_eq!(err, NotificationError::NoDeployment(env.id));
}

#[tokio::test]
async fn test_missing_required_field_is_surfaced() {
    let (store, _, _) = store_with_deployment().await;
    let router = NotificationRouter::new(store);

    let err = router
        .dispatch(&info("murano.report_notification", json!({"id": "x", "text": "no env"})))
        .await
        .unwrap_err();
    assert!(matches!(err, NotificationError::Validation(_)));

    let err = router
        .dispatch(&info("murano.track_instance", json!({"environment": "env-1"})))
        .await
        .unwrap_err();
    assert!(matches!(err, NotificationError::Validation(_)));
}

#[tokio::test]
async fn test_unroutable_notifications_are_ignored() {
    let (store, env, deployment) = store_with_deployment().await;
    let router = NotificationRouter::new(store.clone());
    let payload = json!({"id": "x", "environment_id": env.id, "text": "hi"});

    let wrong_priority = Notification::new(Priority::Error, "murano.report_notification", payload.clone());
    assert_eq!(router.dispatch(&wrong_priority).await.unwrap(), None);

    let unprefixed = info("report_notification", payload.clone());
    assert_eq!(router.dispatch(&unprefixed).await.unwrap(), None);

    let unknown = info("murano.unknown_event", payload);
    assert_eq!(router.dispatch(&unknown).await.unwrap(), None);

    assert!(store.statuses(&deployment.id).await.unwrap().is_empty());
}
