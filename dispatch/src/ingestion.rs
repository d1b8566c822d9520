//! Result ingestion - reconciles a final executor result into deployment state
//!
//! A result is applied in two atomic steps, one per aggregate:
//!
//! 1. Environment: description replaced by the result (`applications`
//!    renamed to `services`), networking refreshed, version + 1.
//! 2. Deployment: the deploying session becomes deployed, the latest
//!    deployment is finished and gets a closing summary status.
//!
//! The steps commit separately. A crash between them leaves the environment
//! updated and the deployment still open.

use chrono::Utc;
use serde_json::Value;

use shared_types::{
    result_environment_id, result_into_description, result_is_deleted, result_networking,
    SessionState, Status, StatusLevel,
};

use crate::app_state::AppState;
use crate::store::{deployments, environments, sessions, StoreError};

/// How a result was handled
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Applied {
        environment_id: String,
        version: i64,
        /// `None` when there was no open deployment to close
        summary: Option<DeploymentSummary>,
    },
    /// The result reports a torn-down environment; nothing changed
    EnvironmentDeleted { environment_id: String },
    /// No such environment; nothing changed
    UnknownEnvironment { environment_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentSummary {
    pub deployment_id: String,
    pub session_id: Option<String>,
    pub errors: i64,
    pub warnings: i64,
    pub text: String,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("invalid result: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<shared_types::PayloadError> for IngestError {
    fn from(e: shared_types::PayloadError) -> Self {
        IngestError::Validation(e.to_string())
    }
}

/// Closing status text for a deployment
pub fn summary_text(errors: i64, warnings: i64) -> String {
    let mut text = String::from("Deployment finished");
    if errors > 0 {
        text.push_str(" with errors");
    } else if warnings > 0 {
        text.push_str(" with warnings");
    }
    text
}

#[derive(Clone)]
pub struct ResultIngestor {
    state: AppState,
}

impl ResultIngestor {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn process(&self, result: Value) -> Result<IngestOutcome, IngestError> {
        let secure_result = self.state.sanitizer().sanitize(&result);
        tracing::debug!(result = %secure_result, "Got result from orchestration engine");

        let environment_id = result_environment_id(&result)?.to_string();

        if result_is_deleted(&result) {
            tracing::debug!(
                environment_id = %environment_id,
                "Result dropped, environment is deleted"
            );
            return Ok(IngestOutcome::EnvironmentDeleted { environment_id });
        }

        if self.state.store().get_environment(&environment_id).await?.is_none() {
            tracing::warn!(
                environment_id = %environment_id,
                "Environment result could not be handled, environment not found"
            );
            return Ok(IngestOutcome::UnknownEnvironment { environment_id });
        }

        let networking = result_networking(&result);
        let description = result_into_description(result);

        let Some(version) = self
            .apply_environment(&environment_id, &description, &networking)
            .await?
        else {
            tracing::warn!(
                environment_id = %environment_id,
                "Environment disappeared while applying result"
            );
            return Ok(IngestOutcome::UnknownEnvironment { environment_id });
        };

        let summary = self.close_deployment(&environment_id).await?;

        tracing::info!(
            environment_id = %environment_id,
            version,
            summary = summary.as_ref().map(|s| s.text.as_str()).unwrap_or("none"),
            "Result reconciled"
        );

        Ok(IngestOutcome::Applied {
            environment_id,
            version,
            summary,
        })
    }

    async fn apply_environment(
        &self,
        environment_id: &str,
        description: &Value,
        networking: &Value,
    ) -> Result<Option<i64>, StoreError> {
        let mut tx = self.state.store().begin().await?;
        let version =
            environments::apply_result(&mut tx, environment_id, description, networking).await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn close_deployment(
        &self,
        environment_id: &str,
    ) -> Result<Option<DeploymentSummary>, StoreError> {
        let mut tx = self.state.store().begin().await?;

        let session_id =
            match sessions::find_by_state(&mut tx, environment_id, SessionState::Deploying).await? {
                Some(session) => {
                    sessions::transition(
                        &mut tx,
                        &session.id,
                        SessionState::Deploying,
                        SessionState::Deployed,
                    )
                    .await?;
                    Some(session.id)
                }
                None => {
                    tracing::debug!(environment_id = %environment_id, "No deploying session to close");
                    None
                }
            };

        let Some(deployment) = deployments::latest_for_environment(&mut tx, environment_id).await?
        else {
            tracing::warn!(environment_id = %environment_id, "No deployment recorded for environment");
            tx.commit().await?;
            return Ok(None);
        };

        // Claims the deployment; a repeated result finds it already finished.
        if !deployments::mark_finished(&mut tx, &deployment.id, Utc::now()).await? {
            tracing::debug!(
                deployment_id = %deployment.id,
                "Deployment already finished, skipping summary"
            );
            tx.commit().await?;
            return Ok(None);
        }

        let errors = deployments::count_statuses(&mut tx, &deployment.id, StatusLevel::Error).await?;
        let warnings =
            deployments::count_statuses(&mut tx, &deployment.id, StatusLevel::Warning).await?;
        let text = summary_text(errors, warnings);

        let status = Status::new(&deployment.id, StatusLevel::Info, &text);
        deployments::insert_status(&mut tx, &status).await?;
        tx.commit().await?;

        Ok(Some(DeploymentSummary {
            deployment_id: deployment.id,
            session_id,
            errors,
            warnings,
            text,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_text() {
        assert_eq!(summary_text(0, 0), "Deployment finished");
        assert_eq!(summary_text(0, 1), "Deployment finished with warnings");
        assert_eq!(summary_text(0, 7), "Deployment finished with warnings");
        assert_eq!(summary_text(1, 0), "Deployment finished with errors");
        assert_eq!(summary_text(3, 5), "Deployment finished with errors");
    }
}
