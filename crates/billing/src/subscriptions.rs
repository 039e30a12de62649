//! Subscription management and mirror.

use std::sync::Arc;

use billbridge_shared::SubscriptionStatus;
use sqlx::PgPool;
use stripe::{
    CreateSubscription, CreateSubscriptionItems, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus, UpdateSubscription, UpdateSubscriptionItems,
};
// Import the proration behavior enum from the subscription module (not subscription_item)
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customers::CustomerRecord;
use crate::error::{BillingError, BillingResult};
use crate::hooks::BillingHooks;

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub stripe_id: String,
    /// Processor price/plan id this subscription is on.
    pub plan: String,
    pub quantity: i64,
    pub status: String,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Normalized subscription state, the common denominator of the API
/// response objects and webhook payloads that feed the mirror.
#[derive(Debug, Clone)]
pub struct SubscriptionFields {
    pub stripe_id: String,
    pub plan: String,
    pub quantity: i64,
    pub status: String,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
}

pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
    hooks: Arc<dyn BillingHooks>,
}

fn timestamp(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool, hooks: Arc<dyn BillingHooks>) -> Self {
        Self { stripe, pool, hooks }
    }

    pub async fn list(&self, customer_id: Uuid) -> BillingResult<Vec<SubscriptionRecord>> {
        let records: Vec<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT id, customer_id, stripe_id, plan, quantity, status, cancel_at_period_end,
                   current_period_start, current_period_end, trial_start, trial_end,
                   canceled_at, created_at, updated_at
            FROM subscriptions
            WHERE customer_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn find_by_stripe_id(
        &self,
        stripe_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT id, customer_id, stripe_id, plan, quantity, status, cancel_at_period_end,
                   current_period_start, current_period_end, trial_start, trial_end,
                   canceled_at, created_at, updated_at
            FROM subscriptions
            WHERE stripe_id = $1
            "#,
        )
        .bind(stripe_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Create a subscription for the customer on the given plan.
    ///
    /// The hooks decide the effective trial period and seat quantity.
    pub async fn create(
        &self,
        customer: &CustomerRecord,
        plan: &str,
        quantity: u64,
    ) -> BillingResult<SubscriptionRecord> {
        let customer_id: stripe::CustomerId = customer.stripe_id.parse().map_err(|_| {
            BillingError::InvalidInput(format!("bad customer id {}", customer.stripe_id))
        })?;

        let quantity = self
            .hooks
            .adjust_subscription_quantity(customer, plan, quantity)
            .max(1);
        let trial_days = self.hooks.trial_period(customer, plan);

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(plan.to_string()),
            quantity: Some(quantity),
            ..Default::default()
        }]);
        if let Some(days) = trial_days {
            params.trial_period_days = Some(days);
        }

        let subscription = Subscription::create(self.stripe.inner(), params).await?;
        let record = self.sync_from_api(customer.id, &subscription).await?;

        tracing::info!(
            customer_id = %customer.stripe_id,
            subscription_id = %record.stripe_id,
            plan = %plan,
            quantity = quantity,
            trial_days = ?trial_days,
            "Subscription created"
        );
        Ok(record)
    }

    /// Move an existing subscription to a different plan, prorating the
    /// difference.
    pub async fn change_plan(
        &self,
        customer: &CustomerRecord,
        sub_stripe_id: &str,
        new_plan: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let sub_id: SubscriptionId = sub_stripe_id.parse().map_err(|_| {
            BillingError::InvalidInput(format!("bad subscription id {sub_stripe_id}"))
        })?;

        // Get current subscription to get the item ID
        let current = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(new_plan.to_string()),
                ..Default::default()
            }]),
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            ..Default::default()
        };

        let subscription = Subscription::update(self.stripe.inner(), &sub_id, params).await?;
        let record = self.sync_from_api(customer.id, &subscription).await?;

        tracing::info!(
            customer_id = %customer.stripe_id,
            subscription_id = %sub_stripe_id,
            plan = %new_plan,
            "Subscription plan changed"
        );
        Ok(record)
    }

    /// Cancel at period end. The subscription stays active until the
    /// current period closes; the processor's later webhook confirms the
    /// final state.
    pub async fn cancel(
        &self,
        customer: &CustomerRecord,
        sub_stripe_id: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let sub_id: SubscriptionId = sub_stripe_id.parse().map_err(|_| {
            BillingError::InvalidInput(format!("bad subscription id {sub_stripe_id}"))
        })?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };
        let subscription = Subscription::update(self.stripe.inner(), &sub_id, params).await?;
        let record = self.sync_from_api(customer.id, &subscription).await?;

        tracing::info!(
            customer_id = %customer.stripe_id,
            subscription_id = %sub_stripe_id,
            "Subscription set to cancel at period end"
        );
        Ok(record)
    }

    /// Mirror a subscription object returned by the processor API.
    pub async fn sync_from_api(
        &self,
        customer_id: Uuid,
        subscription: &Subscription,
    ) -> BillingResult<SubscriptionRecord> {
        let status = match subscription.status {
            StripeSubStatus::Active => SubscriptionStatus::Active,
            StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
            StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
            StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
            StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
            StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
            StripeSubStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
            StripeSubStatus::Paused => SubscriptionStatus::Paused,
        };

        let first_item = subscription.items.data.first();
        let plan = first_item
            .and_then(|item| item.price.as_ref())
            .map(|p| p.id.to_string())
            .unwrap_or_default();
        let quantity = first_item.and_then(|item| item.quantity).unwrap_or(1) as i64;

        self.upsert(
            customer_id,
            &SubscriptionFields {
                stripe_id: subscription.id.to_string(),
                plan,
                quantity,
                status: status.as_str().to_string(),
                cancel_at_period_end: subscription.cancel_at_period_end,
                current_period_start: timestamp(subscription.current_period_start),
                current_period_end: timestamp(subscription.current_period_end),
                trial_start: subscription.trial_start.and_then(timestamp),
                trial_end: subscription.trial_end.and_then(timestamp),
                canceled_at: subscription.canceled_at.and_then(timestamp),
            },
        )
        .await
    }

    /// Idempotent upsert keyed by the subscription's processor id.
    pub async fn upsert(
        &self,
        customer_id: Uuid,
        fields: &SubscriptionFields,
    ) -> BillingResult<SubscriptionRecord> {
        let record: SubscriptionRecord = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                customer_id, stripe_id, plan, quantity, status, cancel_at_period_end,
                current_period_start, current_period_end, trial_start, trial_end, canceled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (stripe_id) DO UPDATE SET
                plan = EXCLUDED.plan,
                quantity = EXCLUDED.quantity,
                status = EXCLUDED.status,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                trial_start = EXCLUDED.trial_start,
                trial_end = EXCLUDED.trial_end,
                canceled_at = EXCLUDED.canceled_at,
                updated_at = NOW()
            RETURNING id, customer_id, stripe_id, plan, quantity, status, cancel_at_period_end,
                      current_period_start, current_period_end, trial_start, trial_end,
                      canceled_at, created_at, updated_at
            "#,
        )
        .bind(customer_id)
        .bind(&fields.stripe_id)
        .bind(&fields.plan)
        .bind(fields.quantity)
        .bind(&fields.status)
        .bind(fields.cancel_at_period_end)
        .bind(fields.current_period_start)
        .bind(fields.current_period_end)
        .bind(fields.trial_start)
        .bind(fields.trial_end)
        .bind(fields.canceled_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }
}
