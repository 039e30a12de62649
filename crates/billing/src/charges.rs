//! Charge mirror and receipt notification.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::customers::CustomerService;
use crate::email::ReceiptEmailService;
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ChargeRecord {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub stripe_id: String,
    pub card_stripe_id: Option<String>,
    pub amount_cents: i64,
    pub amount_refunded_cents: i64,
    pub currency: String,
    pub paid: bool,
    pub refunded: bool,
    pub captured: bool,
    pub disputed: bool,
    pub receipt_sent: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub charged_at: Option<OffsetDateTime>,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Normalized charge state feeding the mirror.
#[derive(Debug, Clone, Default)]
pub struct ChargeFields {
    pub stripe_id: String,
    pub card_stripe_id: Option<String>,
    pub amount_cents: i64,
    pub amount_refunded_cents: i64,
    pub currency: String,
    pub paid: bool,
    pub refunded: bool,
    pub captured: bool,
    pub disputed: bool,
    pub charged_at: Option<OffsetDateTime>,
    pub description: Option<String>,
}

pub struct ChargeService {
    pool: PgPool,
    email: ReceiptEmailService,
}

impl ChargeService {
    pub fn new(pool: PgPool, email: ReceiptEmailService) -> Self {
        Self { pool, email }
    }

    pub async fn list(&self, customer_id: Uuid) -> BillingResult<Vec<ChargeRecord>> {
        let records: Vec<ChargeRecord> = sqlx::query_as(
            r#"
            SELECT id, customer_id, invoice_id, stripe_id, card_stripe_id, amount_cents,
                   amount_refunded_cents, currency, paid, refunded, captured, disputed,
                   receipt_sent, charged_at, description, created_at, updated_at
            FROM charges
            WHERE customer_id = $1
            ORDER BY charged_at DESC NULLS LAST
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn list_for_invoice(&self, invoice_id: Uuid) -> BillingResult<Vec<ChargeRecord>> {
        let records: Vec<ChargeRecord> = sqlx::query_as(
            r#"
            SELECT id, customer_id, invoice_id, stripe_id, card_stripe_id, amount_cents,
                   amount_refunded_cents, currency, paid, refunded, captured, disputed,
                   receipt_sent, charged_at, description, created_at, updated_at
            FROM charges
            WHERE invoice_id = $1
            ORDER BY charged_at ASC NULLS LAST
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Idempotent upsert keyed by the charge's processor id. Never resets
    /// `receipt_sent`: a redelivered event must not re-arm the receipt.
    pub async fn upsert(
        &self,
        customer_id: Uuid,
        invoice_id: Option<Uuid>,
        fields: &ChargeFields,
    ) -> BillingResult<ChargeRecord> {
        let record: ChargeRecord = sqlx::query_as(
            r#"
            INSERT INTO charges (
                customer_id, invoice_id, stripe_id, card_stripe_id, amount_cents,
                amount_refunded_cents, currency, paid, refunded, captured, disputed,
                charged_at, description
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (stripe_id) DO UPDATE SET
                invoice_id = COALESCE(EXCLUDED.invoice_id, charges.invoice_id),
                card_stripe_id = COALESCE(EXCLUDED.card_stripe_id, charges.card_stripe_id),
                amount_cents = EXCLUDED.amount_cents,
                amount_refunded_cents = EXCLUDED.amount_refunded_cents,
                currency = EXCLUDED.currency,
                paid = EXCLUDED.paid,
                refunded = EXCLUDED.refunded,
                captured = EXCLUDED.captured,
                disputed = EXCLUDED.disputed,
                charged_at = EXCLUDED.charged_at,
                description = EXCLUDED.description,
                updated_at = NOW()
            RETURNING id, customer_id, invoice_id, stripe_id, card_stripe_id, amount_cents,
                      amount_refunded_cents, currency, paid, refunded, captured, disputed,
                      receipt_sent, charged_at, description, created_at, updated_at
            "#,
        )
        .bind(customer_id)
        .bind(invoice_id)
        .bind(&fields.stripe_id)
        .bind(&fields.card_stripe_id)
        .bind(fields.amount_cents)
        .bind(fields.amount_refunded_cents)
        .bind(&fields.currency)
        .bind(fields.paid)
        .bind(fields.refunded)
        .bind(fields.captured)
        .bind(fields.disputed)
        .bind(fields.charged_at)
        .bind(&fields.description)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Send the payment receipt for a successful charge, at most once.
    ///
    /// The `receipt_sent` flag is claimed atomically before the send so
    /// that concurrent deliveries of the same event cannot both mail the
    /// customer. A failed send releases the claim for a later replay.
    pub async fn send_receipt(
        &self,
        charge: &ChargeRecord,
        customers: &CustomerService,
    ) -> BillingResult<()> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE charges
            SET receipt_sent = TRUE, updated_at = NOW()
            WHERE stripe_id = $1 AND receipt_sent = FALSE
            RETURNING id
            "#,
        )
        .bind(&charge.stripe_id)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            tracing::debug!(charge_id = %charge.stripe_id, "Receipt already sent, skipping");
            return Ok(());
        }

        let customer: Option<crate::customers::CustomerRecord> = sqlx::query_as(
            r#"
            SELECT id, account_id, stripe_id, email, currency, delinquent, deleted,
                   created_at, updated_at
            FROM customers
            WHERE id = $1
            "#,
        )
        .bind(charge.customer_id)
        .fetch_optional(&self.pool)
        .await?;
        let recipient = match customer {
            Some(record) => customers.notification_email(&record).await?,
            None => None,
        };

        let Some(recipient) = recipient else {
            tracing::warn!(
                charge_id = %charge.stripe_id,
                "No email address for charge customer, receipt not sent"
            );
            return Ok(());
        };

        let result = self
            .email
            .send_receipt(
                &recipient,
                charge.amount_cents,
                &charge.currency,
                charge.description.as_deref(),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                // Release the claim so a replay can retry the receipt.
                sqlx::query(
                    "UPDATE charges SET receipt_sent = FALSE, updated_at = NOW() WHERE stripe_id = $1",
                )
                .bind(&charge.stripe_id)
                .execute(&self.pool)
                .await?;
                Err(BillingError::Email(e.to_string()))
            }
        }
    }
}
