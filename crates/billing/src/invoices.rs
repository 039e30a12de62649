//! Invoice and invoice line item mirrors.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct InvoiceRecord {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub stripe_id: String,
    pub subscription_stripe_id: Option<String>,
    pub amount_due_cents: i64,
    pub subtotal_cents: i64,
    pub total_cents: i64,
    pub currency: String,
    pub paid: bool,
    pub attempted: bool,
    pub attempt_count: i32,
    pub status: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub issued_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct InvoiceItemRecord {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub stripe_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub description: Option<String>,
    pub proration: bool,
    pub line_type: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    pub quantity: Option<i64>,
    pub plan: Option<String>,
}

/// Normalized invoice state feeding the mirror.
#[derive(Debug, Clone, Default)]
pub struct InvoiceFields {
    pub stripe_id: String,
    pub subscription_stripe_id: Option<String>,
    pub amount_due_cents: i64,
    pub subtotal_cents: i64,
    pub total_cents: i64,
    pub currency: String,
    pub paid: bool,
    pub attempted: bool,
    pub attempt_count: i32,
    pub status: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub issued_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct InvoiceItemFields {
    pub stripe_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub description: Option<String>,
    pub proration: bool,
    pub line_type: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub quantity: Option<i64>,
    pub plan: Option<String>,
}

pub struct InvoiceService {
    pool: PgPool,
}

impl InvoiceService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, customer_id: Uuid) -> BillingResult<Vec<InvoiceRecord>> {
        let records: Vec<InvoiceRecord> = sqlx::query_as(
            r#"
            SELECT id, customer_id, stripe_id, subscription_stripe_id, amount_due_cents,
                   subtotal_cents, total_cents, currency, paid, attempted, attempt_count,
                   status, period_start, period_end, issued_at, created_at, updated_at
            FROM invoices
            WHERE customer_id = $1
            ORDER BY issued_at DESC NULLS LAST
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn find_by_stripe_id(&self, stripe_id: &str) -> BillingResult<Option<InvoiceRecord>> {
        let record: Option<InvoiceRecord> = sqlx::query_as(
            r#"
            SELECT id, customer_id, stripe_id, subscription_stripe_id, amount_due_cents,
                   subtotal_cents, total_cents, currency, paid, attempted, attempt_count,
                   status, period_start, period_end, issued_at, created_at, updated_at
            FROM invoices
            WHERE stripe_id = $1
            "#,
        )
        .bind(stripe_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn items_for(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceItemRecord>> {
        let records: Vec<InvoiceItemRecord> = sqlx::query_as(
            r#"
            SELECT id, invoice_id, stripe_id, amount_cents, currency, description, proration,
                   line_type, period_start, period_end, quantity, plan
            FROM invoice_items
            WHERE invoice_id = $1
            ORDER BY period_start ASC NULLS LAST
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Idempotent upsert keyed by the invoice's processor id.
    pub async fn upsert(
        &self,
        customer_id: Uuid,
        fields: &InvoiceFields,
    ) -> BillingResult<InvoiceRecord> {
        let record: InvoiceRecord = sqlx::query_as(
            r#"
            INSERT INTO invoices (
                customer_id, stripe_id, subscription_stripe_id, amount_due_cents,
                subtotal_cents, total_cents, currency, paid, attempted, attempt_count,
                status, period_start, period_end, issued_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (stripe_id) DO UPDATE SET
                subscription_stripe_id = EXCLUDED.subscription_stripe_id,
                amount_due_cents = EXCLUDED.amount_due_cents,
                subtotal_cents = EXCLUDED.subtotal_cents,
                total_cents = EXCLUDED.total_cents,
                currency = EXCLUDED.currency,
                paid = EXCLUDED.paid,
                attempted = EXCLUDED.attempted,
                attempt_count = EXCLUDED.attempt_count,
                status = EXCLUDED.status,
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                issued_at = EXCLUDED.issued_at,
                updated_at = NOW()
            RETURNING id, customer_id, stripe_id, subscription_stripe_id, amount_due_cents,
                      subtotal_cents, total_cents, currency, paid, attempted, attempt_count,
                      status, period_start, period_end, issued_at, created_at, updated_at
            "#,
        )
        .bind(customer_id)
        .bind(&fields.stripe_id)
        .bind(&fields.subscription_stripe_id)
        .bind(fields.amount_due_cents)
        .bind(fields.subtotal_cents)
        .bind(fields.total_cents)
        .bind(&fields.currency)
        .bind(fields.paid)
        .bind(fields.attempted)
        .bind(fields.attempt_count)
        .bind(&fields.status)
        .bind(fields.period_start)
        .bind(fields.period_end)
        .bind(fields.issued_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Idempotent upsert of a single line item.
    pub async fn upsert_item(
        &self,
        invoice_id: Uuid,
        fields: &InvoiceItemFields,
    ) -> BillingResult<InvoiceItemRecord> {
        let record: InvoiceItemRecord = sqlx::query_as(
            r#"
            INSERT INTO invoice_items (
                invoice_id, stripe_id, amount_cents, currency, description, proration,
                line_type, period_start, period_end, quantity, plan
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (stripe_id) DO UPDATE SET
                amount_cents = EXCLUDED.amount_cents,
                currency = EXCLUDED.currency,
                description = EXCLUDED.description,
                proration = EXCLUDED.proration,
                line_type = EXCLUDED.line_type,
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                quantity = EXCLUDED.quantity,
                plan = EXCLUDED.plan
            RETURNING id, invoice_id, stripe_id, amount_cents, currency, description,
                      proration, line_type, period_start, period_end, quantity, plan
            "#,
        )
        .bind(invoice_id)
        .bind(&fields.stripe_id)
        .bind(fields.amount_cents)
        .bind(&fields.currency)
        .bind(&fields.description)
        .bind(fields.proration)
        .bind(&fields.line_type)
        .bind(fields.period_start)
        .bind(fields.period_end)
        .bind(fields.quantity)
        .bind(&fields.plan)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }
}
