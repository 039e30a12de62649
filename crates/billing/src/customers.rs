//! Customer mirror.
//!
//! Local cache of processor-side customers. Each customer is owned by one
//! local account; webhook handlers may create unowned mirrors for
//! customers that first appear in an event, and the REST layer links them
//! when the owning account shows up.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct CustomerRecord {
    pub id: Uuid,
    pub account_id: Option<Uuid>,
    pub stripe_id: String,
    pub email: Option<String>,
    pub currency: Option<String>,
    pub delinquent: bool,
    pub deleted: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Fields a webhook payload or API refresh can update on the mirror.
#[derive(Debug, Clone, Default)]
pub struct CustomerSync {
    pub email: Option<String>,
    pub currency: Option<String>,
    pub delinquent: Option<bool>,
}

pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Explicit get-or-create for the authenticated account.
    ///
    /// Returns the existing mirror when the account already has one;
    /// otherwise creates the customer with the processor and stores the
    /// mirror linked to the account.
    pub async fn get_or_create(&self, account_id: Uuid, email: &str) -> BillingResult<CustomerRecord> {
        if let Some(existing) = self.find_by_account(account_id).await? {
            return Ok(existing);
        }

        let params = stripe::CreateCustomer {
            email: Some(email),
            ..Default::default()
        };
        let customer = stripe::Customer::create(self.stripe.inner(), params).await?;

        let record: CustomerRecord = sqlx::query_as(
            r#"
            INSERT INTO customers (account_id, stripe_id, email, currency)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (stripe_id) DO UPDATE SET
                account_id = EXCLUDED.account_id,
                email = EXCLUDED.email,
                updated_at = NOW()
            RETURNING id, account_id, stripe_id, email, currency, delinquent, deleted,
                      created_at, updated_at
            "#,
        )
        .bind(account_id)
        .bind(customer.id.as_str())
        .bind(customer.email.as_deref().or(Some(email)))
        .bind(customer.currency.map(|c| c.to_string()))
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            account_id = %account_id,
            customer_id = %record.stripe_id,
            "Created processor customer for account"
        );

        Ok(record)
    }

    pub async fn find_by_account(&self, account_id: Uuid) -> BillingResult<Option<CustomerRecord>> {
        let record: Option<CustomerRecord> = sqlx::query_as(
            r#"
            SELECT id, account_id, stripe_id, email, currency, delinquent, deleted,
                   created_at, updated_at
            FROM customers
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn find_by_stripe_id(&self, stripe_id: &str) -> BillingResult<Option<CustomerRecord>> {
        let record: Option<CustomerRecord> = sqlx::query_as(
            r#"
            SELECT id, account_id, stripe_id, email, currency, delinquent, deleted,
                   created_at, updated_at
            FROM customers
            WHERE stripe_id = $1
            "#,
        )
        .bind(stripe_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Like [`Self::find_by_stripe_id`] but a missing mirror is an error.
    /// Handlers use this so an out-of-order event becomes a recoverable
    /// handler failure rather than a silent no-op.
    pub async fn require_by_stripe_id(&self, stripe_id: &str) -> BillingResult<CustomerRecord> {
        self.find_by_stripe_id(stripe_id)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound(stripe_id.to_string()))
    }

    /// Idempotent upsert from a webhook payload. Creates the mirror if this
    /// customer was never seen locally, updates it otherwise; never links
    /// or unlinks the owning account.
    pub async fn upsert_mirror(
        &self,
        stripe_id: &str,
        sync: CustomerSync,
    ) -> BillingResult<CustomerRecord> {
        let record: CustomerRecord = sqlx::query_as(
            r#"
            INSERT INTO customers (stripe_id, email, currency, delinquent)
            VALUES ($1, $2, $3, COALESCE($4, FALSE))
            ON CONFLICT (stripe_id) DO UPDATE SET
                email = COALESCE(EXCLUDED.email, customers.email),
                currency = COALESCE(EXCLUDED.currency, customers.currency),
                delinquent = COALESCE($4, customers.delinquent),
                deleted = FALSE,
                updated_at = NOW()
            RETURNING id, account_id, stripe_id, email, currency, delinquent, deleted,
                      created_at, updated_at
            "#,
        )
        .bind(stripe_id)
        .bind(&sync.email)
        .bind(&sync.currency)
        .bind(sync.delinquent)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Mark a mirror deleted and unlink its account. The row itself stays
    /// for referential integrity with invoices and charges.
    pub async fn mark_deleted(&self, stripe_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE customers
            SET deleted = TRUE, account_id = NULL, updated_at = NOW()
            WHERE stripe_id = $1
            "#,
        )
        .bind(stripe_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh the mirror from the processor's authoritative record.
    pub async fn refresh(&self, record: &CustomerRecord) -> BillingResult<CustomerRecord> {
        let customer_id: stripe::CustomerId = record.stripe_id.parse().map_err(|_| {
            BillingError::InvalidInput(format!("bad customer id {}", record.stripe_id))
        })?;
        let customer = stripe::Customer::retrieve(self.stripe.inner(), &customer_id, &[]).await?;

        self.upsert_mirror(
            record.stripe_id.as_str(),
            CustomerSync {
                email: customer.email.clone(),
                currency: customer.currency.map(|c| c.to_string()),
                delinquent: customer.delinquent,
            },
        )
        .await
    }

    /// Email to notify for this customer: the owning account's address
    /// first, falling back to the processor-side email.
    pub async fn notification_email(
        &self,
        customer: &CustomerRecord,
    ) -> BillingResult<Option<String>> {
        if let Some(account_id) = customer.account_id {
            let row: Option<(String,)> = sqlx::query_as("SELECT email FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some((email,)) = row {
                return Ok(Some(email));
            }
        }
        Ok(customer.email.clone())
    }
}
