use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(()),
        }
    }
}

/// Stored outcome of one optimization request. `result_data` keeps the
/// serialized JSON exactly as written.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    pub request_id: String,
    pub status: JobStatus,
    pub result_data: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    pub fn to_view(&self) -> StatusView {
        StatusView {
            request_id: self.request_id.clone(),
            status: self.status,
            result_data: self.parsed_result(),
            error_message: self.error_message.clone(),
            updated_at: Some(self.updated_at),
        }
    }

    fn parsed_result(&self) -> Option<Value> {
        let raw = self.result_data.as_deref()?;
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(
                    request_id = self.request_id.as_str(),
                    error = %err,
                    "stored result_data is not valid json"
                );
                None
            }
        }
    }
}

/// Write request for the status store.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub result_data: Option<String>,
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn pending() -> Self {
        Self {
            status: JobStatus::Pending,
            result_data: None,
            error_message: None,
        }
    }

    pub fn completed(result: &Value) -> Self {
        Self {
            status: JobStatus::Completed,
            result_data: Some(result.to_string()),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            result_data: None,
            error_message: Some(message.into()),
        }
    }
}

/// Wire shape of a status record, shared by the status check and the stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub request_id: String,
    pub status: JobStatus,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusView {
    pub fn pending(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: JobStatus::Pending,
            result_data: None,
            error_message: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Connected { request_id: String },
    Status(StatusView),
    Error { request_id: String, message: String },
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookEnvelope {
    pub event: Option<String>,
    pub request_id: Option<String>,
    pub id: Option<String>,
    pub data: Option<Value>,
}

impl WebhookEnvelope {
    /// Senders use either `request_id` or `id`; `request_id` wins when both are set.
    pub fn normalized_request_id(&self) -> Option<&str> {
        [self.request_id.as_deref(), self.id.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
    }

    pub fn event_name(&self) -> Option<&str> {
        self.event
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    JobCompleted,
    JobFailed,
}

impl FromStr for WebhookEvent {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "JOB_COMPLETED" => Ok(WebhookEvent::JobCompleted),
            "JOB_FAILED" => Ok(WebhookEvent::JobFailed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub request_id: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum StatusCheckResponse {
    Unknown {
        status: JobStatus,
        request_id: String,
    },
    Known(StatusView),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub error: String,
}
