//! On-disk store: schema survives reopening, constraints hold.

use dispatch::store::{Store, StoreError};
use shared_types::{Environment, Session, SessionState};

#[tokio::test]
async fn test_file_database_persists_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("nested/dispatch.db").display());

    let env = Environment::new("persisted", None);
    {
        let store = Store::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        store.create_environment(&env).await.unwrap();
        store.add_category("Databases").await.unwrap();
        store.pool().close().await;
    }

    let store = Store::connect(&url).await.unwrap();
    store.migrate().await.unwrap();
    let loaded = store.get_environment(&env.id).await.unwrap().unwrap();
    assert_eq!(loaded.name, "persisted");
    assert_eq!(loaded.description, env.description);
    assert_eq!(store.category_names().await.unwrap(), vec!["Databases".to_string()]);
}

#[tokio::test]
async fn test_duplicate_category_is_a_conflict() {
    let store = Store::in_memory().await.unwrap();
    store.add_category("Web").await.unwrap();

    let err = store.add_category("Web").await.unwrap_err();
    assert_eq!(err, StoreError::Conflict("category 'Web' already exists".to_string()));
}

#[tokio::test]
async fn test_one_deploying_session_per_environment() {
    let store = Store::in_memory().await.unwrap();
    let env = Environment::new("web", None);
    store.create_environment(&env).await.unwrap();

    let mut first = Session::open(&env, "a");
    first.state = SessionState::Deploying;
    store.create_session(&first).await.unwrap();

    let mut second = Session::open(&env, "b");
    second.state = SessionState::Deploying;
    let err = store.create_session(&second).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let found = store
        .find_session(&env.id, SessionState::Deploying)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, first.id);
}
