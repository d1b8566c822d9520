//! Control-plane deploy operation
//!
//! Deploying a session moves it from `open` to `deploying`, records a new
//! deployment holding a snapshot of the environment description, and hands
//! the executor a task. The state change and the deployment row commit
//! together; the task is dispatched after the commit. If the task cannot be
//! enqueued, both are rolled back so the session can be deployed again.

use serde_json::{json, Value};

use shared_types::{Deployment, Environment, SessionState};

use crate::app_state::AppState;
use crate::store::{deployments, sessions, StoreError};
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Store(StoreError),

    #[error("task dispatch failed: {0}")]
    Transport(#[from] TransportError),
}

impl From<StoreError> for ControlError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => ControlError::Conflict(msg),
            StoreError::NotFound { entity, id } => ControlError::NotFound { entity, id },
            other => ControlError::Store(other),
        }
    }
}

/// Task body handed to the executor for a deployment
pub fn deployment_task(environment: &Environment, deployment: &Deployment) -> Value {
    json!({
        "id": environment.id,
        "deployment_id": deployment.id,
        "tenant_id": environment.tenant_id,
        "action": {
            "object_id": environment.id,
            "method": "deploy",
            "args": {},
        },
        "model": deployment.description,
    })
}

pub async fn deploy_session(state: &AppState, session_id: &str) -> Result<Deployment, ControlError> {
    let store = state.store();

    let session = store
        .get_session(session_id)
        .await?
        .ok_or_else(|| ControlError::NotFound {
            entity: "session",
            id: session_id.to_string(),
        })?;

    if session.state != SessionState::Open {
        return Err(ControlError::Validation(format!(
            "session {} is {}, only open sessions can be deployed",
            session.id, session.state
        )));
    }

    let environment = store
        .get_environment(&session.environment_id)
        .await?
        .ok_or_else(|| ControlError::NotFound {
            entity: "environment",
            id: session.environment_id.clone(),
        })?;

    let deployment = Deployment::start(&environment.id, environment.description.clone());

    let mut tx = store.begin().await?;
    let moved = sessions::transition(
        &mut tx,
        &session.id,
        SessionState::Open,
        SessionState::Deploying,
    )
    .await
    .map_err(|e| match e {
        StoreError::Conflict(_) => ControlError::Conflict(format!(
            "environment {} already has a deploying session",
            environment.id
        )),
        other => other.into(),
    })?;
    if !moved {
        return Err(ControlError::Conflict(format!(
            "session {} changed state concurrently",
            session.id
        )));
    }
    deployments::insert(&mut tx, &deployment).await?;
    tx.commit().await.map_err(StoreError::from)?;

    tracing::info!(
        session_id = %session.id,
        environment_id = %environment.id,
        deployment_id = %deployment.id,
        "Session deploying"
    );

    if let Err(e) = state
        .task_client()
        .dispatch_task(deployment_task(&environment, &deployment))
        .await
    {
        tracing::warn!(
            session_id = %session.id,
            deployment_id = %deployment.id,
            error = %e,
            "Task dispatch failed, reopening session"
        );
        revert_deploy(state, &session.id, &deployment.id).await?;
        return Err(e.into());
    }

    Ok(deployment)
}

async fn revert_deploy(
    state: &AppState,
    session_id: &str,
    deployment_id: &str,
) -> Result<(), ControlError> {
    let mut tx = state.store().begin().await?;
    sessions::transition(&mut tx, session_id, SessionState::Deploying, SessionState::Open).await?;
    deployments::remove(&mut tx, deployment_id).await?;
    tx.commit().await.map_err(StoreError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_task_shape() {
        let env = Environment::new("web", Some("tenant-1".to_string()));
        let deployment = Deployment::start(&env.id, env.description.clone());
        let task = deployment_task(&env, &deployment);

        assert_eq!(task["id"], json!(env.id));
        assert_eq!(task["deployment_id"], json!(deployment.id));
        assert_eq!(task["action"]["method"], "deploy");
        assert_eq!(task["model"], env.description);
    }

    #[test]
    fn test_store_conflict_maps_to_conflict() {
        let err: ControlError = StoreError::Conflict("dup".to_string()).into();
        assert_eq!(err, ControlError::Conflict("dup".to_string()));

        let err: ControlError = StoreError::Database("io".to_string()).into();
        assert!(matches!(err, ControlError::Store(_)));
    }
}
