//! HTTP route definitions.

pub mod admin;
pub mod billing;
pub mod webhook;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};

use crate::{auth::require_auth, state::AppState};

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Build the application router.
///
/// The webhook endpoint is deliberately outside the auth layer: the
/// processor authenticates with its signature header, not a bearer token.
pub fn create_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/billing/customer", get(billing::get_customer))
        .route(
            "/billing/cards",
            get(billing::list_cards).post(billing::create_card),
        )
        .route(
            "/billing/cards/{card_id}",
            axum::routing::patch(billing::update_card).delete(billing::delete_card),
        )
        .route(
            "/billing/subscriptions",
            get(billing::list_subscriptions).post(billing::create_subscription),
        )
        .route(
            "/billing/subscriptions/{subscription_id}",
            axum::routing::patch(billing::update_subscription).delete(billing::cancel_subscription),
        )
        .route("/billing/invoices", get(billing::list_invoices))
        .route("/billing/plans", get(billing::list_plans))
        .route("/admin/events", get(admin::list_events))
        .route("/admin/events/unprocessed", get(admin::list_unprocessed_events))
        .route("/admin/events/{stripe_id}/replay", post(admin::replay_event))
        .route("/admin/exceptions", get(admin::list_exceptions))
        .layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhook::stripe_webhook))
        .merge(authed)
        .with_state(state)
}
