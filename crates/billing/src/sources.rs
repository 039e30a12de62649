//! Card (payment source) mirror and processor operations.
//!
//! async-stripe 0.39 has no typed surface for the card-source endpoints
//! (`/customers/{id}/sources/...`), so this module posts its own param
//! structs through the client's raw form methods, the same workaround used
//! for other gaps in the generated API.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customers::CustomerRecord;
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct CardRecord {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub stripe_id: String,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
    pub fingerprint: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Card object as returned by the sources endpoints and carried in
/// `customer.source.*` event payloads.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CardPayload {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub last4: Option<String>,
    #[serde(default)]
    pub exp_month: Option<i32>,
    #[serde(default)]
    pub exp_year: Option<i32>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(serde::Serialize)]
struct AttachSourceParams<'a> {
    source: &'a str,
}

#[derive(serde::Serialize)]
struct UpdateCardParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    exp_month: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp_year: Option<i32>,
}

#[derive(Debug, serde::Deserialize)]
struct DeletedPayload {
    #[allow(dead_code)]
    id: String,
    deleted: bool,
}

pub struct CardService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CardService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    pub async fn list(&self, customer_id: Uuid) -> BillingResult<Vec<CardRecord>> {
        let records: Vec<CardRecord> = sqlx::query_as(
            r#"
            SELECT id, customer_id, stripe_id, brand, last4, exp_month, exp_year,
                   fingerprint, created_at, updated_at
            FROM cards
            WHERE customer_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn find_by_stripe_id(&self, stripe_id: &str) -> BillingResult<Option<CardRecord>> {
        let record: Option<CardRecord> = sqlx::query_as(
            r#"
            SELECT id, customer_id, stripe_id, brand, last4, exp_month, exp_year,
                   fingerprint, created_at, updated_at
            FROM cards
            WHERE stripe_id = $1
            "#,
        )
        .bind(stripe_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Attach a tokenized card to the customer and mirror it locally.
    pub async fn create(&self, customer: &CustomerRecord, token: &str) -> BillingResult<CardRecord> {
        let card: CardPayload = self
            .stripe
            .inner()
            .post_form(
                &format!("/customers/{}/sources", customer.stripe_id),
                AttachSourceParams { source: token },
            )
            .await?;

        let record = self.upsert_from_payload(customer.id, &card).await?;

        tracing::info!(
            customer_id = %customer.stripe_id,
            card_id = %record.stripe_id,
            "Payment source attached"
        );
        Ok(record)
    }

    /// Update card expiry with the processor, then refresh the mirror.
    pub async fn update(
        &self,
        customer: &CustomerRecord,
        card_stripe_id: &str,
        exp_month: Option<i32>,
        exp_year: Option<i32>,
    ) -> BillingResult<CardRecord> {
        let card: CardPayload = self
            .stripe
            .inner()
            .post_form(
                &format!("/customers/{}/sources/{}", customer.stripe_id, card_stripe_id),
                UpdateCardParams { exp_month, exp_year },
            )
            .await?;

        self.upsert_from_payload(customer.id, &card).await
    }

    /// Detach the card from the customer and drop the mirror row.
    pub async fn delete(&self, customer: &CustomerRecord, card_stripe_id: &str) -> BillingResult<()> {
        let deleted: DeletedPayload = self
            .stripe
            .inner()
            .delete(&format!(
                "/customers/{}/sources/{}",
                customer.stripe_id, card_stripe_id
            ))
            .await?;

        if !deleted.deleted {
            return Err(BillingError::Internal(format!(
                "processor did not confirm deletion of {card_stripe_id}"
            )));
        }

        self.delete_mirror(card_stripe_id).await?;

        tracing::info!(
            customer_id = %customer.stripe_id,
            card_id = %card_stripe_id,
            "Payment source deleted"
        );
        Ok(())
    }

    /// Idempotent upsert keyed by the card's processor id.
    pub async fn upsert_from_payload(
        &self,
        customer_id: Uuid,
        card: &CardPayload,
    ) -> BillingResult<CardRecord> {
        let record: CardRecord = sqlx::query_as(
            r#"
            INSERT INTO cards (customer_id, stripe_id, brand, last4, exp_month, exp_year, fingerprint)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stripe_id) DO UPDATE SET
                brand = EXCLUDED.brand,
                last4 = EXCLUDED.last4,
                exp_month = EXCLUDED.exp_month,
                exp_year = EXCLUDED.exp_year,
                fingerprint = COALESCE(EXCLUDED.fingerprint, cards.fingerprint),
                updated_at = NOW()
            RETURNING id, customer_id, stripe_id, brand, last4, exp_month, exp_year,
                      fingerprint, created_at, updated_at
            "#,
        )
        .bind(customer_id)
        .bind(&card.id)
        .bind(&card.brand)
        .bind(&card.last4)
        .bind(card.exp_month)
        .bind(card.exp_year)
        .bind(&card.fingerprint)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn delete_mirror(&self, stripe_id: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM cards WHERE stripe_id = $1")
            .bind(stripe_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
