use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{sse::Event, sse::KeepAlive, sse::Sse, IntoResponse},
    Json,
};
use std::{convert::Infallible, time::Duration};
use tokio_stream::StreamExt;

use crate::models::{StatusQuery, StreamParams, WebhookEnvelope};
use crate::service::{self, ServiceError};
use crate::state::AppState;
use crate::stream::{event_stream, StatusSession};

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub async fn readyz(State(state): State<AppState>) -> StatusCode {
    match state.store.ping().await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            tracing::warn!(error = %err, "status store not ready");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

pub async fn webhook(
    State(state): State<AppState>,
    payload: Result<Json<WebhookEnvelope>, JsonRejection>,
) -> impl IntoResponse {
    // Undecodable bodies are client errors like any other malformed envelope.
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            let message = rejection.body_text();
            tracing::warn!(error = message.as_str(), "webhook body rejected");
            let err = ServiceError::bad_request("invalid_body", message);
            return (err.status, Json(err.body)).into_response();
        }
    };

    match service::receive_webhook(&state, payload).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn webhook_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> impl IntoResponse {
    match service::check_status(&state, query).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> impl IntoResponse {
    let Some(request_id) = params
        .request_id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    else {
        let err = ServiceError::bad_request(
            "missing_request_id",
            "request_id is required".to_string(),
        );
        return (err.status, Json(err.body)).into_response();
    };
    let region = params.region.filter(|value| !value.trim().is_empty());

    let session = StatusSession::new(
        request_id,
        region,
        state.store.clone(),
        state.source.clone(),
        state.stream.clone(),
    );
    let events = event_stream(session).filter_map(|event| match Event::default().json_data(&event) {
        Ok(event) => Some(Ok::<_, Infallible>(event)),
        Err(err) => {
            tracing::warn!(error = %err, "failed to encode stream event");
            None
        }
    });

    Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}
