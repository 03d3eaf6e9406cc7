use axum::http::StatusCode;
use serde_json::{json, Value};

use crate::models::{
    ErrorResponse, JobStatus, StatusCheckResponse, StatusQuery, StatusUpdate, WebhookEnvelope,
    WebhookEvent, WebhookResponse,
};
use crate::state::AppState;
use crate::store::UpsertOutcome;

const DEFAULT_FAILURE_MESSAGE: &str = "Optimization failed";

pub struct ServiceError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ServiceError {
    pub fn new(status: StatusCode, code: &'static str, message: String) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code,
                error: message,
            },
        }
    }

    pub fn bad_request(code: &'static str, message: String) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }
}

/// Placeholder stored when the sender acknowledges completion without the result body.
pub fn completion_marker() -> Value {
    json!({ "webhook_received": true, "full_result_pending": true })
}

fn failure_message(data: Option<&Value>) -> String {
    data.and_then(|data| {
        ["error", "message"]
            .iter()
            .filter_map(|key| data.get(key).and_then(Value::as_str))
            .map(str::trim)
            .find(|message| !message.is_empty())
    })
    .unwrap_or(DEFAULT_FAILURE_MESSAGE)
    .to_string()
}

pub async fn receive_webhook(
    state: &AppState,
    envelope: WebhookEnvelope,
) -> Result<WebhookResponse, ServiceError> {
    let (Some(event_name), Some(request_id)) =
        (envelope.event_name(), envelope.normalized_request_id())
    else {
        tracing::warn!(
            event = envelope.event.as_deref().unwrap_or(""),
            "webhook rejected, missing event or request id"
        );
        return Err(ServiceError::bad_request(
            "missing_fields",
            "Missing required fields".to_string(),
        ));
    };

    let Ok(event) = event_name.parse::<WebhookEvent>() else {
        tracing::warn!(request_id, event = event_name, "webhook rejected, unknown event");
        return Err(ServiceError::bad_request(
            "unknown_event",
            format!("Unknown event type: {event_name}"),
        ));
    };

    let update = match event {
        WebhookEvent::JobCompleted => {
            let result = envelope.data.clone().unwrap_or_else(completion_marker);
            StatusUpdate::completed(&result)
        }
        WebhookEvent::JobFailed => StatusUpdate::failed(failure_message(envelope.data.as_ref())),
    };

    let outcome = state.store.upsert(request_id, update).await.map_err(|err| {
        tracing::error!(request_id, error = %err, "webhook status write failed");
        ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            err.to_string(),
        )
    })?;

    tracing::info!(
        request_id,
        event = event_name,
        status = outcome.record().status.as_str(),
        written = matches!(outcome, UpsertOutcome::Written(_)),
        "webhook processed"
    );
    Ok(WebhookResponse { success: true })
}

pub async fn check_status(
    state: &AppState,
    query: StatusQuery,
) -> Result<StatusCheckResponse, ServiceError> {
    let request_id = query
        .request_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            ServiceError::bad_request("missing_request_id", "request_id is required".to_string())
        })?;

    let record = state.store.get(request_id).await.map_err(|err| {
        tracing::error!(request_id, error = %err, "status lookup failed");
        ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            err.to_string(),
        )
    })?;

    Ok(match record {
        Some(record) => StatusCheckResponse::Known(record.to_view()),
        None => StatusCheckResponse::Unknown {
            status: JobStatus::Pending,
            request_id: request_id.to_string(),
        },
    })
}
