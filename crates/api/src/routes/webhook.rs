//! Processor webhook endpoint.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};

use billbridge_billing::parse_notification;

use crate::{error::ApiError, state::AppState};

/// Handle a webhook delivery from the payment processor.
///
/// Only two failures cross this boundary as non-2xx: a signature that does
/// not verify and a body that cannot be parsed. Those are the deliveries a
/// processor retry can actually fix. Everything else — duplicates, handler
/// failures, storage trouble — is absorbed by the ingestor and answered
/// with 200 so the processor never retries an event that is already
/// recorded.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    billing
        .webhooks
        .verify_signature(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Webhook signature verification failed");
            ApiError::BadRequest("invalid webhook signature".to_string())
        })?;

    let notification = parse_notification(&body).map_err(|e| {
        tracing::warn!(error = %e, "Webhook body could not be parsed");
        ApiError::BadRequest(format!("malformed webhook body: {e}"))
    })?;

    let outcome = billing.webhooks.ingest(notification).await;
    tracing::info!(outcome = ?outcome, "Webhook delivery handled");

    Ok(StatusCode::OK)
}
