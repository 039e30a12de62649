//! Transfer mirror with per-charge fee breakdown.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct TransferRecord {
    pub id: Uuid,
    pub stripe_id: String,
    pub event_stripe_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub transfer_date: Option<OffsetDateTime>,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct TransferChargeFeeRecord {
    pub id: Uuid,
    pub transfer_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub application: Option<String>,
    pub description: Option<String>,
    pub kind: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default)]
pub struct TransferFields {
    pub stripe_id: String,
    pub event_stripe_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: Option<String>,
    pub transfer_date: Option<OffsetDateTime>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TransferChargeFeeFields {
    pub amount_cents: i64,
    pub currency: String,
    pub application: Option<String>,
    pub description: Option<String>,
    pub kind: Option<String>,
}

pub struct TransferService {
    pool: PgPool,
}

impl TransferService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_recent(&self, limit: i64) -> BillingResult<Vec<TransferRecord>> {
        let records: Vec<TransferRecord> = sqlx::query_as(
            r#"
            SELECT id, stripe_id, event_stripe_id, amount_cents, currency, status,
                   transfer_date, description, created_at, updated_at
            FROM transfers
            ORDER BY transfer_date DESC NULLS LAST
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Idempotent upsert keyed by the transfer's processor id.
    pub async fn upsert(&self, fields: &TransferFields) -> BillingResult<TransferRecord> {
        let record: TransferRecord = sqlx::query_as(
            r#"
            INSERT INTO transfers (
                stripe_id, event_stripe_id, amount_cents, currency, status,
                transfer_date, description
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stripe_id) DO UPDATE SET
                event_stripe_id = COALESCE(EXCLUDED.event_stripe_id, transfers.event_stripe_id),
                amount_cents = EXCLUDED.amount_cents,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                transfer_date = EXCLUDED.transfer_date,
                description = EXCLUDED.description,
                updated_at = NOW()
            RETURNING id, stripe_id, event_stripe_id, amount_cents, currency, status,
                      transfer_date, description, created_at, updated_at
            "#,
        )
        .bind(&fields.stripe_id)
        .bind(&fields.event_stripe_id)
        .bind(fields.amount_cents)
        .bind(&fields.currency)
        .bind(&fields.status)
        .bind(fields.transfer_date)
        .bind(&fields.description)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Replace the fee breakdown for a transfer. The payload always carries
    /// the full fee list, so replacing keeps the sync idempotent.
    pub async fn replace_fees(
        &self,
        transfer_id: Uuid,
        fees: &[TransferChargeFeeFields],
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM transfer_charge_fees WHERE transfer_id = $1")
            .bind(transfer_id)
            .execute(&mut *tx)
            .await?;

        for fee in fees {
            sqlx::query(
                r#"
                INSERT INTO transfer_charge_fees (
                    transfer_id, amount_cents, currency, application, description, kind
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(transfer_id)
            .bind(fee.amount_cents)
            .bind(&fee.currency)
            .bind(&fee.application)
            .bind(&fee.description)
            .bind(&fee.kind)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn fees_for(&self, transfer_id: Uuid) -> BillingResult<Vec<TransferChargeFeeRecord>> {
        let records: Vec<TransferChargeFeeRecord> = sqlx::query_as(
            r#"
            SELECT id, transfer_id, amount_cents, currency, application, description,
                   kind, created_at
            FROM transfer_charge_fees
            WHERE transfer_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(transfer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
