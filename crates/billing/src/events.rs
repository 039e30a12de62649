//! Event store and duplicate detection for inbound webhook notifications.
//!
//! Every notification the processor delivers is persisted here exactly
//! once, keyed by the processor-assigned event id. The UNIQUE constraint on
//! `stripe_events.stripe_id` is the authoritative guard: two concurrent
//! deliveries of the same id both race through [`EventStore::record`], and
//! the constraint guarantees that exactly one of them wins. The loser gets
//! [`BillingError::DuplicateEvent`] and falls into the logged-duplicate
//! branch of the webhook pipeline.
//!
//! The store has two backends: Postgres for production and an in-memory
//! map for tests and self-hosted smoke runs, mirroring the dual-backend
//! shape used elsewhere in the workspace.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// One stored webhook notification.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: Uuid,
    /// Processor-assigned event id, globally unique.
    pub stripe_id: String,
    /// Event type tag, e.g. `customer.created`.
    pub kind: String,
    pub livemode: bool,
    /// Raw payload as delivered.
    pub message: serde_json::Value,
    /// Normalized payload attached by the handler after validation.
    pub validated_message: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub processed: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

#[derive(Default)]
struct MemoryEvents {
    by_stripe_id: HashMap<String, EventRecord>,
}

#[derive(Clone)]
enum Backend {
    Postgres(PgPool),
    Memory(Arc<Mutex<MemoryEvents>>),
}

/// Persistence for webhook events, keyed by processor event id.
#[derive(Clone)]
pub struct EventStore {
    backend: Backend,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            backend: Backend::Postgres(pool),
        }
    }

    /// In-memory backend with the same uniqueness semantics, for tests and
    /// environments without Postgres.
    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(MemoryEvents::default()))),
        }
    }

    /// Record a new event in unprocessed state.
    ///
    /// Returns [`BillingError::DuplicateEvent`] when an event with this id
    /// already exists. The insert-or-nothing form makes the check and the
    /// insert a single atomic operation, so concurrent deliveries of the
    /// same id cannot both succeed.
    pub async fn record(
        &self,
        stripe_id: &str,
        kind: &str,
        livemode: bool,
        message: serde_json::Value,
    ) -> BillingResult<EventRecord> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let inserted: Option<EventRecord> = sqlx::query_as(
                    r#"
                    INSERT INTO stripe_events (stripe_id, kind, livemode, message)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (stripe_id) DO NOTHING
                    RETURNING id, stripe_id, kind, livemode, message, validated_message,
                              received_at, processed, processed_at
                    "#,
                )
                .bind(stripe_id)
                .bind(kind)
                .bind(livemode)
                .bind(&message)
                .fetch_optional(pool)
                .await?;

                inserted.ok_or_else(|| BillingError::DuplicateEvent(stripe_id.to_string()))
            }
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                if state.by_stripe_id.contains_key(stripe_id) {
                    return Err(BillingError::DuplicateEvent(stripe_id.to_string()));
                }
                let record = EventRecord {
                    id: Uuid::new_v4(),
                    stripe_id: stripe_id.to_string(),
                    kind: kind.to_string(),
                    livemode,
                    message,
                    validated_message: None,
                    received_at: OffsetDateTime::now_utc(),
                    processed: false,
                    processed_at: None,
                };
                state
                    .by_stripe_id
                    .insert(stripe_id.to_string(), record.clone());
                Ok(record)
            }
        }
    }

    /// Whether an event with this processor id has already been recorded.
    /// Pure read; the constraint in [`Self::record`] remains the authority.
    pub async fn is_duplicate(&self, stripe_id: &str) -> BillingResult<bool> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let (exists,): (bool,) =
                    sqlx::query_as("SELECT EXISTS (SELECT 1 FROM stripe_events WHERE stripe_id = $1)")
                        .bind(stripe_id)
                        .fetch_one(pool)
                        .await?;
                Ok(exists)
            }
            Backend::Memory(state) => Ok(state.lock().await.by_stripe_id.contains_key(stripe_id)),
        }
    }

    /// Mark an event processed, attaching the handler's validated payload.
    /// Idempotent: marking an already-processed event is a no-op update.
    pub async fn mark_processed(
        &self,
        id: Uuid,
        validated_message: Option<serde_json::Value>,
    ) -> BillingResult<()> {
        match &self.backend {
            Backend::Postgres(pool) => {
                sqlx::query(
                    r#"
                    UPDATE stripe_events
                    SET processed = TRUE,
                        processed_at = COALESCE(processed_at, NOW()),
                        validated_message = COALESCE($2, validated_message)
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(validated_message)
                .execute(pool)
                .await?;
                Ok(())
            }
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                if let Some(record) = state.by_stripe_id.values_mut().find(|r| r.id == id) {
                    if !record.processed {
                        record.processed = true;
                        record.processed_at = Some(OffsetDateTime::now_utc());
                    }
                    if validated_message.is_some() {
                        record.validated_message = validated_message;
                    }
                }
                Ok(())
            }
        }
    }

    pub async fn find(&self, stripe_id: &str) -> BillingResult<Option<EventRecord>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let record: Option<EventRecord> = sqlx::query_as(
                    r#"
                    SELECT id, stripe_id, kind, livemode, message, validated_message,
                           received_at, processed, processed_at
                    FROM stripe_events
                    WHERE stripe_id = $1
                    "#,
                )
                .bind(stripe_id)
                .fetch_optional(pool)
                .await?;
                Ok(record)
            }
            Backend::Memory(state) => Ok(state.lock().await.by_stripe_id.get(stripe_id).cloned()),
        }
    }

    /// Most recently received events, for operator listings.
    pub async fn list_recent(&self, limit: i64) -> BillingResult<Vec<EventRecord>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let records: Vec<EventRecord> = sqlx::query_as(
                    r#"
                    SELECT id, stripe_id, kind, livemode, message, validated_message,
                           received_at, processed, processed_at
                    FROM stripe_events
                    ORDER BY received_at DESC
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
                let mut records: Vec<EventRecord> =
                    state.by_stripe_id.values().cloned().collect();
                records.sort_by(|a, b| b.received_at.cmp(&a.received_at));
                records.truncate(limit.max(0) as usize);
                Ok(records)
            }
        }
    }

    /// Events whose handler has not completed, candidates for replay.
    pub async fn list_unprocessed(&self, limit: i64) -> BillingResult<Vec<EventRecord>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let records: Vec<EventRecord> = sqlx::query_as(
                    r#"
                    SELECT id, stripe_id, kind, livemode, message, validated_message,
                           received_at, processed, processed_at
                    FROM stripe_events
                    WHERE NOT processed
                    ORDER BY received_at ASC
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
                let mut records: Vec<EventRecord> = state
                    .by_stripe_id
                    .values()
                    .filter(|r| !r.processed)
                    .cloned()
                    .collect();
                records.sort_by(|a, b| a.received_at.cmp(&b.received_at));
                records.truncate(limit.max(0) as usize);
                Ok(records)
            }
        }
    }
}
