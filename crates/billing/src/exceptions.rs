//! Processing exception log.
//!
//! Failures and anomalies met while handling webhook events land here:
//! duplicate deliveries, handler failures, payloads that failed
//! validation. Rows carry the full raw payload so an operator can replay
//! the event after fixing the underlying cause. Entries are never deleted
//! automatically.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::BillingResult;

/// One logged processing failure or anomaly.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ExceptionRecord {
    pub id: Uuid,
    /// The stored event this exception refers to. Duplicate deliveries have
    /// no event of their own, so this is optional.
    pub event_id: Option<Uuid>,
    pub message: String,
    pub traceback: Option<String>,
    /// Raw payload kept for manual replay.
    pub data: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Default)]
struct MemoryExceptions {
    records: HashMap<Uuid, ExceptionRecord>,
}

#[derive(Clone)]
enum Backend {
    Postgres(PgPool),
    Memory(Arc<Mutex<MemoryExceptions>>),
}

/// Append-only log of webhook processing failures.
#[derive(Clone)]
pub struct ExceptionLog {
    backend: Backend,
}

impl ExceptionLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            backend: Backend::Postgres(pool),
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(MemoryExceptions::default()))),
        }
    }

    /// Persist an exception record.
    ///
    /// Callers on the webhook path treat a storage failure here as
    /// non-fatal: they log it and still answer success upstream, because a
    /// non-2xx response would make the processor redeliver an event the
    /// system has already seen.
    pub async fn log(
        &self,
        data: serde_json::Value,
        message: &str,
        event_id: Option<Uuid>,
        traceback: Option<String>,
    ) -> BillingResult<ExceptionRecord> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let record: ExceptionRecord = sqlx::query_as(
                    r#"
                    INSERT INTO event_processing_exceptions (event_id, message, traceback, data)
                    VALUES ($1, $2, $3, $4)
                    RETURNING id, event_id, message, traceback, data, created_at
                    "#,
                )
                .bind(event_id)
                .bind(message)
                .bind(&traceback)
                .bind(&data)
                .fetch_one(pool)
                .await?;
                Ok(record)
            }
            Backend::Memory(state) => {
                let record = ExceptionRecord {
                    id: Uuid::new_v4(),
                    event_id,
                    message: message.to_string(),
                    traceback,
                    data: Some(data),
                    created_at: OffsetDateTime::now_utc(),
                };
                state
                    .lock()
                    .await
                    .records
                    .insert(record.id, record.clone());
                Ok(record)
            }
        }
    }

    pub async fn list_recent(&self, limit: i64) -> BillingResult<Vec<ExceptionRecord>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let records: Vec<ExceptionRecord> = sqlx::query_as(
                    r#"
                    SELECT id, event_id, message, traceback, data, created_at
                    FROM event_processing_exceptions
                    ORDER BY created_at DESC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(pool)
                .await?;
                Ok(records)
            }
            Backend::Memory(state) => {
                let state = state.lock().await;
                let mut records: Vec<ExceptionRecord> = state.records.values().cloned().collect();
                records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                records.truncate(limit.max(0) as usize);
                Ok(records)
            }
        }
    }

    /// Exceptions attached to a specific stored event.
    pub async fn list_for_event(&self, event_id: Uuid) -> BillingResult<Vec<ExceptionRecord>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let records: Vec<ExceptionRecord> = sqlx::query_as(
                    r#"
                    SELECT id, event_id, message, traceback, data, created_at
                    FROM event_processing_exceptions
                    WHERE event_id = $1
                    ORDER BY created_at ASC
                    "#,
                )
                .bind(event_id)
                .fetch_all(pool)
                .await?;
                Ok(records)
            }
            Backend::Memory(state) => {
                let state = state.lock().await;
                let mut records: Vec<ExceptionRecord> = state
                    .records
                    .values()
                    .filter(|r| r.event_id == Some(event_id))
                    .cloned()
                    .collect();
                records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                Ok(records)
            }
        }
    }
}
