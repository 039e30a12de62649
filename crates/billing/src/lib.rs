// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Billbridge Billing Module
//!
//! Mirrors billing-account state (customers, cards, subscriptions,
//! invoices, charges, transfers, plans) from the payment processor and
//! ingests its webhook notifications.
//!
//! ## Features
//!
//! - **Webhook ingestion**: exactly-once event recording with a
//!   storage-level uniqueness guarantee, duplicate logging, and per-kind
//!   dispatch to idempotent mirror handlers
//! - **Exception log**: every processing failure is kept with its payload
//!   for operator inspection and manual replay
//! - **Mirror services**: local caches of processor-side billing entities,
//!   upserted by processor id
//! - **REST operations**: card and subscription mutations delegated to the
//!   processor, followed by a mirror refresh
//! - **Receipts**: email notification for successful charges, idempotent
//!   through a claimed `receipt_sent` flag

pub mod charges;
pub mod client;
pub mod customers;
pub mod dispatch;
pub mod email;
pub mod error;
pub mod events;
pub mod exceptions;
pub mod hooks;
pub mod invoices;
pub mod plans;
pub mod sources;
pub mod subscriptions;
pub mod transfers;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Charges
pub use charges::{ChargeFields, ChargeRecord, ChargeService};

// Client
pub use client::{StripeClient, StripeConfig};

// Customers
pub use customers::{CustomerRecord, CustomerService, CustomerSync};

// Dispatch
pub use dispatch::{Dispatcher, HandlerKind};

// Email
pub use email::ReceiptEmailService;

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventRecord, EventStore};

// Exceptions
pub use exceptions::{ExceptionLog, ExceptionRecord};

// Hooks
pub use hooks::{BillingHooks, DefaultHooks};

// Invoices
pub use invoices::{InvoiceItemRecord, InvoiceRecord, InvoiceService};

// Plans
pub use plans::{PlanRecord, PlanService};

// Sources
pub use sources::{CardPayload, CardRecord, CardService};

// Subscriptions
pub use subscriptions::{SubscriptionFields, SubscriptionRecord, SubscriptionService};

// Transfers
pub use transfers::{TransferChargeFeeRecord, TransferRecord, TransferService};

// Webhooks
pub use webhooks::{
    parse_notification, IngestOutcome, Notification, ReplayResult, WebhookIngestor,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub customers: CustomerService,
    pub cards: CardService,
    pub subscriptions: SubscriptionService,
    pub invoices: InvoiceService,
    pub charges: ChargeService,
    pub transfers: TransferService,
    pub plans: PlanService,
    pub email: ReceiptEmailService,
    pub webhooks: WebhookIngestor,
}

impl BillingService {
    /// Create a new billing service from environment variables with the
    /// default hooks.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        let hooks = Arc::new(DefaultHooks::new(config.default_trial_days));
        Ok(Self::with_hooks(config, pool, hooks))
    }

    /// Create a new billing service with explicit config and the default
    /// hooks.
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let hooks = Arc::new(DefaultHooks::new(config.default_trial_days));
        Self::with_hooks(config, pool, hooks)
    }

    /// Create a new billing service with a deployment-specific hook set.
    pub fn with_hooks(config: StripeConfig, pool: PgPool, hooks: Arc<dyn BillingHooks>) -> Self {
        let webhook_secret = config.webhook_secret.clone();
        let stripe = StripeClient::new(config);
        let email = ReceiptEmailService::from_env();

        let dispatcher =
            Dispatcher::new(stripe.clone(), pool.clone(), email.clone(), hooks.clone());
        let webhooks = WebhookIngestor::new(
            EventStore::new(pool.clone()),
            ExceptionLog::new(pool.clone()),
            dispatcher,
            webhook_secret,
        );

        Self {
            customers: CustomerService::new(stripe.clone(), pool.clone()),
            cards: CardService::new(stripe.clone(), pool.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone(), hooks),
            invoices: InvoiceService::new(pool.clone()),
            charges: ChargeService::new(pool.clone(), email.clone()),
            transfers: TransferService::new(pool.clone()),
            plans: PlanService::new(pool),
            email,
            webhooks,
        }
    }
}
