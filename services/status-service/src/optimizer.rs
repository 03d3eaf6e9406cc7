use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

const RESULT_PATH: &str = "/optimization/v2/result";

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Processing { message: String },
    Completed(Value),
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("optimization api key is not configured")]
    NotConfigured,
    #[error("optimization api request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("optimization api returned status {0}")]
    Status(u16),
}

/// Direct read of an optimization job from the external API.
#[async_trait]
pub trait ResultSource: Send + Sync {
    async fn fetch_result(
        &self,
        request_id: &str,
        region: Option<&str>,
    ) -> Result<PollOutcome, SourceError>;
}

/// A non-empty `message` means the job is still running; anything else is the result.
pub fn classify_response(body: Value) -> PollOutcome {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(str::to_string);

    match message {
        Some(message) => PollOutcome::Processing { message },
        None => PollOutcome::Completed(body),
    }
}

#[derive(Clone)]
pub struct NextBillionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl NextBillionClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ResultSource for NextBillionClient {
    async fn fetch_result(
        &self,
        request_id: &str,
        region: Option<&str>,
    ) -> Result<PollOutcome, SourceError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(SourceError::NotConfigured);
        };

        let mut query = vec![("id", request_id), ("key", api_key)];
        if let Some(region) = region {
            query.push(("region", region));
        }

        let response = self
            .http
            .get(format!("{}{}", self.base_url, RESULT_PATH))
            .query(&query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }

        let body: Value = response.json().await?;
        Ok(classify_response(body))
    }
}
