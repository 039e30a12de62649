//! Billing resource routes.
//!
//! Thin CRUD facade over the mirror tables: mutations are delegated to the
//! payment processor through the billing services, which refresh the local
//! mirror before responding. Processor-side failures (declined card,
//! invalid plan) surface as 400s with the processor's message.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use billbridge_billing::{
    BillingService, CardRecord, ChargeRecord, CustomerRecord, InvoiceItemRecord, InvoiceRecord,
    PlanRecord, SubscriptionRecord,
};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

fn billing_service(state: &AppState) -> Result<&Arc<BillingService>, ApiError> {
    state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)
}

/// The authenticated account's customer mirror, created with the processor
/// on first touch.
async fn current_customer(
    billing: &BillingService,
    auth_user: &AuthUser,
) -> Result<CustomerRecord, ApiError> {
    Ok(billing
        .customers
        .get_or_create(auth_user.account_id, &auth_user.email)
        .await?)
}

// =============================================================================
// Customer
// =============================================================================

pub async fn get_customer(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CustomerRecord>> {
    let billing = billing_service(&state)?;
    let customer = current_customer(billing, &auth_user).await?;
    Ok(Json(customer))
}

// =============================================================================
// Cards
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateCardRequest {
    /// Tokenized card from the processor's client-side library.
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCardRequest {
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
}

pub async fn list_cards(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<CardRecord>>> {
    let billing = billing_service(&state)?;
    let customer = current_customer(billing, &auth_user).await?;
    Ok(Json(billing.cards.list(customer.id).await?))
}

pub async fn create_card(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateCardRequest>,
) -> ApiResult<Json<CardRecord>> {
    let billing = billing_service(&state)?;
    let customer = current_customer(billing, &auth_user).await?;
    let card = billing.cards.create(&customer, &req.token).await?;
    Ok(Json(card))
}

/// Look up a card by processor id and check it belongs to the caller.
async fn owned_card(
    billing: &BillingService,
    customer: &CustomerRecord,
    card_id: &str,
) -> Result<CardRecord, ApiError> {
    let card = billing
        .cards
        .find_by_stripe_id(card_id)
        .await?
        .filter(|card| card.customer_id == customer.id)
        .ok_or_else(|| ApiError::NotFound(format!("card {card_id}")))?;
    Ok(card)
}

pub async fn update_card(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(card_id): Path<String>,
    Json(req): Json<UpdateCardRequest>,
) -> ApiResult<Json<CardRecord>> {
    let billing = billing_service(&state)?;
    let customer = current_customer(billing, &auth_user).await?;
    let card = owned_card(billing, &customer, &card_id).await?;

    let updated = billing
        .cards
        .update(&customer, &card.stripe_id, req.exp_month, req.exp_year)
        .await?;
    Ok(Json(updated))
}

pub async fn delete_card(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(card_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let billing = billing_service(&state)?;
    let customer = current_customer(billing, &auth_user).await?;
    let card = owned_card(billing, &customer, &card_id).await?;

    billing.cards.delete(&customer, &card.stripe_id).await?;
    Ok(Json(serde_json::json!({ "deleted": true, "id": card.stripe_id })))
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    /// Processor price/plan id.
    pub plan: String,
    pub quantity: Option<u64>,
    /// Optional card token to attach before subscribing.
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSubscriptionRequest {
    pub plan: String,
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<SubscriptionRecord>>> {
    let billing = billing_service(&state)?;
    let customer = current_customer(billing, &auth_user).await?;
    Ok(Json(billing.subscriptions.list(customer.id).await?))
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> ApiResult<Json<SubscriptionRecord>> {
    let billing = billing_service(&state)?;
    let customer = current_customer(billing, &auth_user).await?;

    if let Some(token) = &req.token {
        billing.cards.create(&customer, token).await?;
    }

    let subscription = billing
        .subscriptions
        .create(&customer, &req.plan, req.quantity.unwrap_or(1))
        .await?;
    Ok(Json(subscription))
}

/// Look up a subscription by processor id and check it belongs to the caller.
async fn owned_subscription(
    billing: &BillingService,
    customer: &CustomerRecord,
    subscription_id: &str,
) -> Result<SubscriptionRecord, ApiError> {
    let subscription = billing
        .subscriptions
        .find_by_stripe_id(subscription_id)
        .await?
        .filter(|sub| sub.customer_id == customer.id)
        .ok_or_else(|| ApiError::NotFound(format!("subscription {subscription_id}")))?;
    Ok(subscription)
}

pub async fn update_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(subscription_id): Path<String>,
    Json(req): Json<UpdateSubscriptionRequest>,
) -> ApiResult<Json<SubscriptionRecord>> {
    let billing = billing_service(&state)?;
    let customer = current_customer(billing, &auth_user).await?;
    let subscription = owned_subscription(billing, &customer, &subscription_id).await?;

    let updated = billing
        .subscriptions
        .change_plan(&customer, &subscription.stripe_id, &req.plan)
        .await?;
    Ok(Json(updated))
}

/// Sets the subscription to end at the close of the current period rather
/// than deleting it immediately.
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(subscription_id): Path<String>,
) -> ApiResult<Json<SubscriptionRecord>> {
    let billing = billing_service(&state)?;
    let customer = current_customer(billing, &auth_user).await?;
    let subscription = owned_subscription(billing, &customer, &subscription_id).await?;

    let canceled = billing
        .subscriptions
        .cancel(&customer, &subscription.stripe_id)
        .await?;
    Ok(Json(canceled))
}

// =============================================================================
// Invoices (read-only)
// =============================================================================

#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    #[serde(flatten)]
    pub invoice: InvoiceRecord,
    pub items: Vec<InvoiceItemRecord>,
    pub charges: Vec<ChargeRecord>,
}

pub async fn list_invoices(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<InvoiceResponse>>> {
    let billing = billing_service(&state)?;
    let customer = current_customer(billing, &auth_user).await?;

    let invoices = billing.invoices.list(customer.id).await?;
    let mut responses = Vec::with_capacity(invoices.len());
    for invoice in invoices {
        let items = billing.invoices.items_for(invoice.id).await?;
        let charges = billing.charges.list_for_invoice(invoice.id).await?;
        responses.push(InvoiceResponse {
            invoice,
            items,
            charges,
        });
    }
    Ok(Json(responses))
}

// =============================================================================
// Plans (read-only)
// =============================================================================

pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<PlanRecord>>> {
    let billing = billing_service(&state)?;
    Ok(Json(billing.plans.list().await?))
}
