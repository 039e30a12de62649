//! Plan mirror.
//!
//! Plans change rarely and are seeded by operators (or synced out of band);
//! the REST layer only reads them.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct PlanRecord {
    pub id: Uuid,
    pub stripe_id: String,
    pub name: String,
    pub amount_cents: i64,
    pub currency: String,
    pub billing_interval: String,
    pub trial_days: Option<i32>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub struct PlanService {
    pool: PgPool,
}

impl PlanService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> BillingResult<Vec<PlanRecord>> {
        let records: Vec<PlanRecord> = sqlx::query_as(
            r#"
            SELECT id, stripe_id, name, amount_cents, currency, billing_interval,
                   trial_days, created_at
            FROM plans
            ORDER BY amount_cents ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn find_by_stripe_id(&self, stripe_id: &str) -> BillingResult<Option<PlanRecord>> {
        let record: Option<PlanRecord> = sqlx::query_as(
            r#"
            SELECT id, stripe_id, name, amount_cents, currency, billing_interval,
                   trial_days, created_at
            FROM plans
            WHERE stripe_id = $1
            "#,
        )
        .bind(stripe_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn upsert(
        &self,
        stripe_id: &str,
        name: &str,
        amount_cents: i64,
        currency: &str,
        billing_interval: &str,
        trial_days: Option<i32>,
    ) -> BillingResult<PlanRecord> {
        let record: PlanRecord = sqlx::query_as(
            r#"
            INSERT INTO plans (stripe_id, name, amount_cents, currency, billing_interval, trial_days)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (stripe_id) DO UPDATE SET
                name = EXCLUDED.name,
                amount_cents = EXCLUDED.amount_cents,
                currency = EXCLUDED.currency,
                billing_interval = EXCLUDED.billing_interval,
                trial_days = EXCLUDED.trial_days
            RETURNING id, stripe_id, name, amount_cents, currency, billing_interval,
                      trial_days, created_at
            "#,
        )
        .bind(stripe_id)
        .bind(name)
        .bind(amount_cents)
        .bind(currency)
        .bind(billing_interval)
        .bind(trial_days)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }
}
