use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::models::{StatusRecord, StatusUpdate};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),
    #[error("invalid status `{0}` in store")]
    InvalidStatus(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Written(StatusRecord),
    /// A pending write hit a terminal record; the stored record is unchanged.
    KeptTerminal(StatusRecord),
}

impl UpsertOutcome {
    pub fn record(&self) -> &StatusRecord {
        match self {
            UpsertOutcome::Written(record) | UpsertOutcome::KeptTerminal(record) => record,
        }
    }

    pub fn into_record(self) -> StatusRecord {
        match self {
            UpsertOutcome::Written(record) | UpsertOutcome::KeptTerminal(record) => record,
        }
    }
}

/// Keyed job outcome shared by the webhook receiver and every open stream.
///
/// Implementations must make the terminal guard part of the write itself:
/// a `pending` update never replaces `completed` or `failed`, and every
/// accepted write moves `updated_at` strictly forward. A terminal record can
/// still be replaced by the other terminal status (last writer wins).
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn upsert(
        &self,
        request_id: &str,
        update: StatusUpdate,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, request_id: &str) -> Result<Option<StatusRecord>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<String, StatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn upsert(
        &self,
        request_id: &str,
        update: StatusUpdate,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut records = self.records.lock().await;
        let previous = records.get(request_id);

        if let Some(existing) = previous {
            if existing.status.is_terminal() && !update.status.is_terminal() {
                return Ok(UpsertOutcome::KeptTerminal(existing.clone()));
            }
        }

        let now = Utc::now();
        let updated_at = match previous {
            Some(existing) if now <= existing.updated_at => {
                existing.updated_at + chrono::Duration::microseconds(1)
            }
            _ => now,
        };
        let record = StatusRecord {
            request_id: request_id.to_string(),
            status: update.status,
            result_data: update.result_data,
            error_message: update.error_message,
            updated_at,
        };
        records.insert(request_id.to_string(), record.clone());
        Ok(UpsertOutcome::Written(record))
    }

    async fn get(&self, request_id: &str) -> Result<Option<StatusRecord>, StoreError> {
        Ok(self.records.lock().await.get(request_id).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
