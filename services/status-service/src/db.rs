use async_trait::async_trait;
use std::sync::Arc;
use tokio_postgres::{Client, NoTls, Row};

use crate::models::{JobStatus, StatusRecord, StatusUpdate};
use crate::store::{StatusStore, StoreError, UpsertOutcome};

const SQL_CREATE_MIGRATIONS: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (\
version INTEGER PRIMARY KEY, \
applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW())";
const SQL_MIGRATION_APPLIED: &str = "SELECT 1 FROM schema_migrations WHERE version = $1";
const SQL_RECORD_MIGRATION: &str = "INSERT INTO schema_migrations (version) VALUES ($1)";
const SQL_MIGRATION_LOCK: &str = "SELECT pg_advisory_xact_lock($1)";
const MIGRATION_LOCK_KEY: i64 = 0x726f_7574_6566_6c77;

/// Schema changes, applied in order at startup. Append only.
const MIGRATIONS: &[(i32, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS optimization_status (\
request_id TEXT PRIMARY KEY, \
status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed')), \
result_data TEXT, \
error_message TEXT, \
updated_at TIMESTAMPTZ NOT NULL)",
)];

// The WHERE clause is the terminal guard; a pending write against a
// terminal row updates nothing and returns no row.
const SQL_UPSERT_STATUS: &str = "INSERT INTO optimization_status AS current \
(request_id, status, result_data, error_message, updated_at) \
VALUES ($1, $2, $3, $4, clock_timestamp()) \
ON CONFLICT (request_id) DO UPDATE SET \
status = EXCLUDED.status, \
result_data = EXCLUDED.result_data, \
error_message = EXCLUDED.error_message, \
updated_at = GREATEST(EXCLUDED.updated_at, current.updated_at + INTERVAL '1 microsecond') \
WHERE current.status = 'pending' OR EXCLUDED.status <> 'pending' \
RETURNING request_id, status, result_data, error_message, updated_at";
const SQL_SELECT_STATUS: &str = "SELECT request_id, status, result_data, error_message, updated_at \
FROM optimization_status WHERE request_id = $1";
const SQL_PING: &str = "SELECT 1";

pub struct PostgresStatusStore {
    client: Arc<Client>,
}

impl PostgresStatusStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let (mut client, connection) = tokio_postgres::connect(database_url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(error = %err, "database connection error");
            }
        });

        run_migrations(&mut client).await?;
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

async fn run_migrations(client: &mut Client) -> Result<(), StoreError> {
    let tx = client.transaction().await?;
    // Serializes replicas migrating at the same time; released on commit.
    tx.execute(SQL_MIGRATION_LOCK, &[&MIGRATION_LOCK_KEY]).await?;
    tx.batch_execute(SQL_CREATE_MIGRATIONS).await?;

    for (version, sql) in MIGRATIONS {
        if tx.query_opt(SQL_MIGRATION_APPLIED, &[version]).await?.is_some() {
            continue;
        }
        tx.batch_execute(sql).await?;
        tx.execute(SQL_RECORD_MIGRATION, &[version]).await?;
        tracing::info!(version = *version, "applied schema migration");
    }

    tx.commit().await?;
    Ok(())
}

fn record_from_row(row: &Row) -> Result<StatusRecord, StoreError> {
    let status: String = row.get("status");
    let status = status
        .parse::<JobStatus>()
        .map_err(|_| StoreError::InvalidStatus(status.clone()))?;

    Ok(StatusRecord {
        request_id: row.get("request_id"),
        status,
        result_data: row.get("result_data"),
        error_message: row.get("error_message"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl StatusStore for PostgresStatusStore {
    async fn upsert(
        &self,
        request_id: &str,
        update: StatusUpdate,
    ) -> Result<UpsertOutcome, StoreError> {
        let written = self
            .client
            .query_opt(
                SQL_UPSERT_STATUS,
                &[
                    &request_id,
                    &update.status.as_str(),
                    &update.result_data,
                    &update.error_message,
                ],
            )
            .await?;

        if let Some(row) = written {
            return Ok(UpsertOutcome::Written(record_from_row(&row)?));
        }

        // Guard rejected the write, so a terminal row exists.
        match self.get(request_id).await? {
            Some(record) => Ok(UpsertOutcome::KeptTerminal(record)),
            None => Err(StoreError::Unavailable(format!(
                "upsert for {request_id} returned no row"
            ))),
        }
    }

    async fn get(&self, request_id: &str) -> Result<Option<StatusRecord>, StoreError> {
        let row = self
            .client
            .query_opt(SQL_SELECT_STATUS, &[&request_id])
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.client.query_one(SQL_PING, &[]).await?;
        Ok(())
    }
}
