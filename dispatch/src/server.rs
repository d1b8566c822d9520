//! Background servers consuming the results and notifications topics
//!
//! Each server owns one queue handle and handles messages one at a time in
//! arrival order. Deliveries are acknowledged before they are handled. A
//! handler failure is logged (and, for results, replied to the caller) and
//! the loop moves on to the next message.

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shared_types::Notification;

use crate::app_state::AppState;
use crate::ingestion::{IngestOutcome, ResultIngestor};
use crate::notifications::NotificationRouter;
use crate::rpc::{RpcRequest, METHOD_PROCESS_RESULT};
use crate::transport::{Delivery, QueueHandle, QueueOptions, ReplyResult, TransportError};

/// Reply body sent back to `deliver_result` callers
pub fn outcome_reply(outcome: &IngestOutcome) -> Value {
    match outcome {
        IngestOutcome::Applied {
            environment_id,
            version,
            summary,
        } => json!({
            "status": "applied",
            "environment_id": environment_id,
            "version": version,
            "deployment_id": summary.as_ref().map(|s| s.deployment_id.clone()),
            "summary": summary.as_ref().map(|s| s.text.clone()),
        }),
        IngestOutcome::EnvironmentDeleted { environment_id } => json!({
            "status": "environment_deleted",
            "environment_id": environment_id,
        }),
        IngestOutcome::UnknownEnvironment { environment_id } => json!({
            "status": "unknown_environment",
            "environment_id": environment_id,
        }),
    }
}

pub fn spawn_results_server(
    state: AppState,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), TransportError>> {
    tokio::spawn(async move {
        let topic = state.config().results_topic.clone();
        let server_id = state.config().server_id.clone();
        let mut queue = open(&state, &topic).await?;
        let ingestor = ResultIngestor::new(state);

        tracing::info!(server_id = %server_id, queue = %queue.queue_name(), "Results server started");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = queue.receive() => received?,
            };
            let Some(mut delivery) = received else {
                continue;
            };
            queue.ack(&delivery).await?;

            let reply = handle_result_request(&ingestor, &delivery).await;
            if delivery.expects_reply() && !delivery.reply(reply) {
                tracing::warn!(
                    server_id = %server_id,
                    message_id = %delivery.id,
                    "Caller stopped waiting before the result was processed"
                );
            }
        }

        tracing::info!(server_id = %server_id, queue = %topic, "Results server stopped");
        Ok(())
    })
}

async fn handle_result_request(ingestor: &ResultIngestor, delivery: &Delivery) -> ReplyResult {
    let mut request: RpcRequest = serde_json::from_value(delivery.body.clone()).map_err(|e| {
        tracing::error!(message_id = %delivery.id, error = %e, "Malformed RPC request");
        format!("malformed request: {e}")
    })?;

    if request.method != METHOD_PROCESS_RESULT {
        tracing::error!(method = %request.method, "Unsupported RPC method");
        return Err(format!("unsupported method '{}'", request.method));
    }

    let Some(result) = request.take_arg("result") else {
        tracing::error!(message_id = %delivery.id, "process_result called without a result");
        return Err("missing argument 'result'".to_string());
    };

    match ingestor.process(result).await {
        Ok(outcome) => Ok(outcome_reply(&outcome)),
        Err(e) => {
            tracing::error!(message_id = %delivery.id, error = %e, "Result processing failed");
            Err(e.to_string())
        }
    }
}

pub fn spawn_notification_server(
    state: AppState,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), TransportError>> {
    tokio::spawn(async move {
        let topic = state.config().notifications_topic.clone();
        let server_id = state.config().server_id.clone();
        let mut queue = open(&state, &topic).await?;
        let router = NotificationRouter::new(state.store().clone());

        tracing::info!(server_id = %server_id, queue = %queue.queue_name(), "Notification server started");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = queue.receive() => received?,
            };
            let Some(delivery) = received else {
                continue;
            };
            queue.ack(&delivery).await?;

            let notification: Notification = match serde_json::from_value(delivery.body.clone()) {
                Ok(notification) => notification,
                Err(e) => {
                    tracing::error!(
                        server_id = %server_id,
                        message_id = %delivery.id,
                        error = %e,
                        "Malformed notification"
                    );
                    continue;
                }
            };

            if let Err(e) = router.dispatch(&notification).await {
                tracing::error!(
                    server_id = %server_id,
                    event_type = %notification.event_type,
                    error = %e,
                    "Notification handling failed"
                );
            }
        }

        tracing::info!(server_id = %server_id, queue = %topic, "Notification server stopped");
        Ok(())
    })
}

async fn open(state: &AppState, topic: &str) -> Result<Box<dyn QueueHandle>, TransportError> {
    let transport = state.transport();
    transport.declare_queue(topic, QueueOptions::default()).await?;
    transport.open_queue(topic).await
}
