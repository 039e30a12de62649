//! Event dispatcher.
//!
//! Maps an event's kind to the handler that mutates local mirror state.
//! The mapping is a static table over an open enumeration: recognized
//! families route to a handler, everything else is a recorded no-op so new
//! processor event kinds can never break ingestion.
//!
//! Handlers validate the raw stored payload themselves (the event store
//! keeps the body exactly as delivered) and return the normalized payload
//! that gets attached to the event as its validated message. Every handler
//! is idempotent at the domain level: mirrors are upserted by processor id,
//! never blindly inserted, so replaying a payload converges on the same
//! state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::charges::{ChargeFields, ChargeService};
use crate::client::StripeClient;
use crate::customers::{CustomerService, CustomerSync};
use crate::email::ReceiptEmailService;
use crate::error::{BillingError, BillingResult};
use crate::events::EventRecord;
use crate::hooks::BillingHooks;
use crate::invoices::{InvoiceFields, InvoiceItemFields, InvoiceService};
use crate::sources::{CardPayload, CardService};
use crate::subscriptions::{SubscriptionFields, SubscriptionService};
use crate::transfers::{TransferChargeFeeFields, TransferFields, TransferService};

/// Handler selected for an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Customer,
    Card,
    Subscription,
    Invoice,
    InvoiceItem,
    Charge,
    Transfer,
    /// Recognized as unhandled: the event is recorded and marked processed
    /// without touching any mirror.
    NoOp,
}

impl HandlerKind {
    /// Static mapping from the processor's kind tag to a handler.
    pub fn for_kind(kind: &str) -> HandlerKind {
        match kind {
            "customer.created" | "customer.updated" | "customer.deleted" => HandlerKind::Customer,
            _ if kind.starts_with("customer.subscription.") => HandlerKind::Subscription,
            _ if kind.starts_with("customer.source.") || kind.starts_with("customer.card.") => {
                HandlerKind::Card
            }
            _ if kind.starts_with("invoiceitem.") => HandlerKind::InvoiceItem,
            _ if kind.starts_with("invoice.") => HandlerKind::Invoice,
            _ if kind.starts_with("charge.") => HandlerKind::Charge,
            _ if kind.starts_with("transfer.") => HandlerKind::Transfer,
            _ => HandlerKind::NoOp,
        }
    }
}

// ---------------------------------------------------------------------------
// Validated payload shapes
// ---------------------------------------------------------------------------

/// `id` of a field that the processor may deliver either as a bare id
/// string or as an expanded object.
fn expandable_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => map
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerPayload {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub delinquent: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    pub id: String,
    pub customer: serde_json::Value,
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_start: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub plan: Option<PlanStub>,
    #[serde(default)]
    pub items: Option<ItemList>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStub {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<ItemStub>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemStub {
    #[serde(default)]
    pub price: Option<PlanStub>,
    #[serde(default)]
    pub quantity: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoicePayload {
    /// Upcoming invoices are delivered without an id; they cannot be
    /// mirrored and are skipped.
    #[serde(default)]
    pub id: Option<String>,
    pub customer: serde_json::Value,
    #[serde(default)]
    pub subscription: Option<serde_json::Value>,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub subtotal: i64,
    #[serde(default)]
    pub total: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub attempted: bool,
    #[serde(default)]
    pub attempt_count: i32,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub lines: Option<LineList>,
}

fn default_currency() -> String {
    "usd".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineList {
    #[serde(default)]
    pub data: Vec<LinePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinePayload {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub proration: bool,
    #[serde(rename = "type", default)]
    pub line_type: Option<String>,
    #[serde(default)]
    pub period: Option<LinePeriod>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub plan: Option<PlanStub>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinePeriod {
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceItemPayload {
    pub id: String,
    #[serde(default)]
    pub invoice: Option<serde_json::Value>,
    #[serde(default)]
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub proration: bool,
    #[serde(default)]
    pub period: Option<LinePeriod>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub plan: Option<PlanStub>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargePayload {
    pub id: String,
    pub customer: serde_json::Value,
    #[serde(default)]
    pub invoice: Option<serde_json::Value>,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub amount_refunded: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub refunded: bool,
    #[serde(default)]
    pub captured: bool,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source: Option<CardStub>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardStub {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputePayload {
    pub charge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferPayload {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub date: Option<i64>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub summary: Option<TransferSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSummary {
    #[serde(default)]
    pub charge_fee_details: Vec<FeeDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeDetail {
    #[serde(default)]
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub application: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Applies a stored event to local state via the mirror services.
pub struct Dispatcher {
    stripe: StripeClient,
    pool: PgPool,
    email: ReceiptEmailService,
    hooks: Arc<dyn BillingHooks>,
}

fn timestamp(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

impl Dispatcher {
    pub fn new(
        stripe: StripeClient,
        pool: PgPool,
        email: ReceiptEmailService,
        hooks: Arc<dyn BillingHooks>,
    ) -> Self {
        Self {
            stripe,
            pool,
            email,
            hooks,
        }
    }

    /// Apply the event to local state. Returns the validated payload to
    /// attach to the event record.
    pub async fn dispatch(&self, event: &EventRecord) -> BillingResult<serde_json::Value> {
        match HandlerKind::for_kind(&event.kind) {
            HandlerKind::Customer => self.handle_customer(event).await,
            HandlerKind::Card => self.handle_card(event).await,
            HandlerKind::Subscription => self.handle_subscription(event).await,
            HandlerKind::Invoice => self.handle_invoice(event).await,
            HandlerKind::InvoiceItem => self.handle_invoice_item(event).await,
            HandlerKind::Charge => self.handle_charge(event).await,
            HandlerKind::Transfer => self.handle_transfer(event).await,
            HandlerKind::NoOp => {
                // Track unhandled kinds so new processor events that may
                // need handlers show up in the logs.
                tracing::info!(
                    kind = %event.kind,
                    event_id = %event.stripe_id,
                    "No handler configured for event kind"
                );
                Ok(serde_json::Value::Null)
            }
        }
    }

    /// Extract and deserialize `data.object` from the stored raw payload.
    fn object<T: serde::de::DeserializeOwned>(&self, event: &EventRecord) -> BillingResult<T> {
        let object = event
            .message
            .get("data")
            .and_then(|d| d.get("object"))
            .ok_or_else(|| BillingError::PayloadValidation {
                kind: event.kind.clone(),
                detail: "missing data.object".to_string(),
            })?;
        serde_json::from_value(object.clone()).map_err(|e| BillingError::PayloadValidation {
            kind: event.kind.clone(),
            detail: e.to_string(),
        })
    }

    fn customer_ref(&self, event: &EventRecord, value: &serde_json::Value) -> BillingResult<String> {
        expandable_id(value).ok_or_else(|| BillingError::PayloadValidation {
            kind: event.kind.clone(),
            detail: "missing customer reference".to_string(),
        })
    }

    async fn handle_customer(&self, event: &EventRecord) -> BillingResult<serde_json::Value> {
        let payload: CustomerPayload = self.object(event)?;
        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());

        if event.kind == "customer.deleted" {
            customers.mark_deleted(&payload.id).await?;
            tracing::info!(customer_id = %payload.id, "Customer mirror marked deleted");
        } else {
            customers
                .upsert_mirror(
                    &payload.id,
                    CustomerSync {
                        email: payload.email.clone(),
                        currency: payload.currency.clone(),
                        delinquent: payload.delinquent,
                    },
                )
                .await?;
            if payload.delinquent == Some(true) {
                tracing::warn!(
                    customer_id = %payload.id,
                    "Customer marked as delinquent - payment issues detected"
                );
            }
        }

        Ok(serde_json::to_value(&payload)?)
    }

    async fn handle_card(&self, event: &EventRecord) -> BillingResult<serde_json::Value> {
        let payload: CardPayload = self.object(event)?;
        let cards = CardService::new(self.stripe.clone(), self.pool.clone());

        if event.kind.ends_with(".deleted") {
            cards.delete_mirror(&payload.id).await?;
            tracing::info!(card_id = %payload.id, "Card mirror deleted");
            return Ok(serde_json::json!({ "id": payload.id, "deleted": true }));
        }

        let customer_stripe_id =
            payload
                .customer
                .clone()
                .ok_or_else(|| BillingError::PayloadValidation {
                    kind: event.kind.clone(),
                    detail: "missing customer reference".to_string(),
                })?;
        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        let customer = customers.require_by_stripe_id(&customer_stripe_id).await?;

        let record = cards.upsert_from_payload(customer.id, &payload).await?;
        tracing::info!(
            customer_id = %customer.stripe_id,
            card_id = %record.stripe_id,
            "Card mirror updated"
        );

        Ok(serde_json::json!({
            "id": record.stripe_id,
            "customer": customer.stripe_id,
            "brand": record.brand,
            "last4": record.last4,
            "exp_month": record.exp_month,
            "exp_year": record.exp_year,
        }))
    }

    async fn handle_subscription(&self, event: &EventRecord) -> BillingResult<serde_json::Value> {
        let payload: SubscriptionPayload = self.object(event)?;
        let customer_stripe_id = self.customer_ref(event, &payload.customer)?;

        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        let customer = customers.require_by_stripe_id(&customer_stripe_id).await?;

        // Plan id comes from the legacy `plan` field or the first item's
        // price, whichever the processor's API version delivered.
        let plan = payload
            .plan
            .as_ref()
            .map(|p| p.id.clone())
            .or_else(|| {
                payload
                    .items
                    .as_ref()
                    .and_then(|items| items.data.first())
                    .and_then(|item| item.price.as_ref())
                    .map(|p| p.id.clone())
            })
            .unwrap_or_default();

        let quantity = payload
            .quantity
            .or_else(|| {
                payload
                    .items
                    .as_ref()
                    .and_then(|items| items.data.first())
                    .and_then(|item| item.quantity)
            })
            .unwrap_or(1);

        let subscriptions =
            SubscriptionService::new(self.stripe.clone(), self.pool.clone(), self.hooks.clone());
        let record = subscriptions
            .upsert(
                customer.id,
                &SubscriptionFields {
                    stripe_id: payload.id.clone(),
                    plan,
                    quantity,
                    status: payload.status.clone(),
                    cancel_at_period_end: payload.cancel_at_period_end,
                    current_period_start: payload.current_period_start.and_then(timestamp),
                    current_period_end: payload.current_period_end.and_then(timestamp),
                    trial_start: payload.trial_start.and_then(timestamp),
                    trial_end: payload.trial_end.and_then(timestamp),
                    canceled_at: payload.canceled_at.and_then(timestamp),
                },
            )
            .await?;

        tracing::info!(
            customer_id = %customer.stripe_id,
            subscription_id = %record.stripe_id,
            status = %record.status,
            cancel_at_period_end = record.cancel_at_period_end,
            "Subscription mirror updated"
        );

        Ok(serde_json::to_value(&payload)?)
    }

    async fn handle_invoice(&self, event: &EventRecord) -> BillingResult<serde_json::Value> {
        let payload: InvoicePayload = self.object(event)?;

        let Some(invoice_stripe_id) = payload.id.clone() else {
            // invoice.upcoming carries no id; there is nothing to mirror.
            tracing::debug!(kind = %event.kind, "Invoice payload without id, skipping mirror");
            return Ok(serde_json::to_value(&payload)?);
        };

        let customer_stripe_id = self.customer_ref(event, &payload.customer)?;
        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        let customer = customers.require_by_stripe_id(&customer_stripe_id).await?;

        let invoices = InvoiceService::new(self.pool.clone());
        let record = invoices
            .upsert(
                customer.id,
                &InvoiceFields {
                    stripe_id: invoice_stripe_id,
                    subscription_stripe_id: payload
                        .subscription
                        .as_ref()
                        .and_then(expandable_id),
                    amount_due_cents: payload.amount_due,
                    subtotal_cents: payload.subtotal,
                    total_cents: payload.total,
                    currency: payload.currency.clone(),
                    paid: payload.paid,
                    attempted: payload.attempted,
                    attempt_count: payload.attempt_count,
                    status: payload.status.clone(),
                    period_start: payload.period_start.and_then(timestamp),
                    period_end: payload.period_end.and_then(timestamp),
                    issued_at: payload.created.and_then(timestamp),
                },
            )
            .await?;

        if let Some(lines) = &payload.lines {
            for line in &lines.data {
                invoices
                    .upsert_item(
                        record.id,
                        &InvoiceItemFields {
                            stripe_id: line.id.clone(),
                            amount_cents: line.amount,
                            currency: line.currency.clone(),
                            description: line.description.clone(),
                            proration: line.proration,
                            line_type: line.line_type.clone(),
                            period_start: line
                                .period
                                .as_ref()
                                .and_then(|p| p.start)
                                .and_then(timestamp),
                            period_end: line
                                .period
                                .as_ref()
                                .and_then(|p| p.end)
                                .and_then(timestamp),
                            quantity: line.quantity,
                            plan: line.plan.as_ref().map(|p| p.id.clone()),
                        },
                    )
                    .await?;
            }
        }

        tracing::info!(
            customer_id = %customer.stripe_id,
            invoice_id = %record.stripe_id,
            paid = record.paid,
            "Invoice mirror updated"
        );

        Ok(serde_json::to_value(&payload)?)
    }

    async fn handle_invoice_item(&self, event: &EventRecord) -> BillingResult<serde_json::Value> {
        let payload: InvoiceItemPayload = self.object(event)?;

        let invoice_stripe_id = payload
            .invoice
            .as_ref()
            .and_then(expandable_id)
            .ok_or_else(|| BillingError::PayloadValidation {
                kind: event.kind.clone(),
                detail: "missing invoice reference".to_string(),
            })?;

        let invoices = InvoiceService::new(self.pool.clone());
        let invoice = invoices
            .find_by_stripe_id(&invoice_stripe_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {invoice_stripe_id}")))?;

        invoices
            .upsert_item(
                invoice.id,
                &InvoiceItemFields {
                    stripe_id: payload.id.clone(),
                    amount_cents: payload.amount,
                    currency: payload.currency.clone(),
                    description: payload.description.clone(),
                    proration: payload.proration,
                    line_type: Some("invoiceitem".to_string()),
                    period_start: payload
                        .period
                        .as_ref()
                        .and_then(|p| p.start)
                        .and_then(timestamp),
                    period_end: payload
                        .period
                        .as_ref()
                        .and_then(|p| p.end)
                        .and_then(timestamp),
                    quantity: payload.quantity,
                    plan: payload.plan.as_ref().map(|p| p.id.clone()),
                },
            )
            .await?;

        Ok(serde_json::to_value(&payload)?)
    }

    async fn handle_charge(&self, event: &EventRecord) -> BillingResult<serde_json::Value> {
        // Dispute events carry a dispute object referencing the charge.
        if event.kind.starts_with("charge.dispute.") {
            let dispute: DisputePayload = self.object(event)?;
            let result = sqlx::query(
                "UPDATE charges SET disputed = TRUE, updated_at = NOW() WHERE stripe_id = $1",
            )
            .bind(&dispute.charge)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(BillingError::NotFound(format!("charge {}", dispute.charge)));
            }
            tracing::warn!(charge_id = %dispute.charge, "Charge disputed");
            return Ok(serde_json::to_value(&dispute)?);
        }

        let payload: ChargePayload = self.object(event)?;
        let customer_stripe_id = self.customer_ref(event, &payload.customer)?;

        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        let customer = customers.require_by_stripe_id(&customer_stripe_id).await?;

        let invoices = InvoiceService::new(self.pool.clone());
        let invoice_id = match payload.invoice.as_ref().and_then(expandable_id) {
            Some(invoice_stripe_id) => invoices
                .find_by_stripe_id(&invoice_stripe_id)
                .await?
                .map(|inv| inv.id),
            None => None,
        };

        let charges = ChargeService::new(self.pool.clone(), self.email.clone());
        let record = charges
            .upsert(
                customer.id,
                invoice_id,
                &ChargeFields {
                    stripe_id: payload.id.clone(),
                    card_stripe_id: payload.source.as_ref().and_then(|s| s.id.clone()),
                    amount_cents: payload.amount,
                    amount_refunded_cents: payload.amount_refunded,
                    currency: payload.currency.clone(),
                    paid: payload.paid,
                    refunded: payload.refunded,
                    captured: payload.captured,
                    disputed: false,
                    charged_at: payload.created.and_then(timestamp),
                    description: payload.description.clone(),
                },
            )
            .await?;

        tracing::info!(
            customer_id = %customer.stripe_id,
            charge_id = %record.stripe_id,
            amount_cents = record.amount_cents,
            paid = record.paid,
            "Charge mirror updated"
        );

        if event.kind == "charge.succeeded" && record.paid {
            charges.send_receipt(&record, &customers).await?;
        }

        Ok(serde_json::to_value(&payload)?)
    }

    async fn handle_transfer(&self, event: &EventRecord) -> BillingResult<serde_json::Value> {
        let payload: TransferPayload = self.object(event)?;

        let transfers = TransferService::new(self.pool.clone());
        let record = transfers
            .upsert(&TransferFields {
                stripe_id: payload.id.clone(),
                event_stripe_id: Some(event.stripe_id.clone()),
                amount_cents: payload.amount,
                currency: payload.currency.clone(),
                status: payload.status.clone(),
                transfer_date: payload.date.or(payload.created).and_then(timestamp),
                description: payload.description.clone(),
            })
            .await?;

        if let Some(summary) = &payload.summary {
            let fees: Vec<TransferChargeFeeFields> = summary
                .charge_fee_details
                .iter()
                .map(|fee| TransferChargeFeeFields {
                    amount_cents: fee.amount,
                    currency: fee.currency.clone(),
                    application: fee.application.clone(),
                    description: fee.description.clone(),
                    kind: fee.kind.clone(),
                })
                .collect();
            transfers.replace_fees(record.id, &fees).await?;
        }

        tracing::info!(
            transfer_id = %record.stripe_id,
            amount_cents = record.amount_cents,
            status = ?record.status,
            "Transfer mirror updated"
        );

        Ok(serde_json::to_value(&payload)?)
    }
}
