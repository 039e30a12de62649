//! Webhook ingestion pipeline.
//!
//! Receives untrusted, possibly duplicated, possibly out-of-order event
//! notifications and applies them to local state exactly once:
//!
//! 1. verify the `Stripe-Signature` header (when a secret is configured)
//! 2. parse the body into a notification; a malformed body is the only
//!    failure the processor is asked to retry
//! 3. check for a duplicate, then record the event; the store's unique
//!    constraint resolves the race between concurrent deliveries
//! 4. dispatch to the kind's handler; handler failures are written to the
//!    exception log with the full payload for manual replay
//!
//! Everything past parse answers success upstream. The processor retries on
//! non-2xx, and a retry of an already-recorded event is indistinguishable
//! from a duplicate, so failures are swallowed here and surfaced to
//! operators instead.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::error::{BillingError, BillingResult};
use crate::events::{EventRecord, EventStore};
use crate::exceptions::{ExceptionLog, ExceptionRecord};

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance (5 minutes).
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A parsed inbound notification, before any storage.
#[derive(Debug, Clone)]
pub struct Notification {
    pub stripe_id: String,
    pub kind: String,
    pub livemode: bool,
    /// Full body as delivered, stored verbatim as the event's message.
    pub payload: serde_json::Value,
}

/// Terminal state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Recorded and handled (including recognized no-op kinds).
    Processed,
    /// Already seen; logged to the exception log and ignored.
    Duplicate,
    /// Recorded but the handler (or the recording itself) failed; an
    /// exception row holds the payload for manual replay.
    Failed,
}

/// Result of an operator-initiated replay of a stored event.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplayResult {
    pub stripe_id: String,
    pub kind: String,
    pub previously_processed: bool,
    pub success: bool,
    pub error: Option<String>,
}

/// Decode a webhook body into a [`Notification`].
///
/// This is the one gate that may reject a delivery: a body that is not
/// JSON or lacks the `id`/`type` fields cannot be recorded and is worth a
/// processor retry.
pub fn parse_notification(body: &str) -> BillingResult<Notification> {
    let payload: serde_json::Value =
        serde_json::from_str(body).map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

    let stripe_id = payload
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BillingError::MalformedPayload("missing event id".to_string()))?
        .to_string();
    let kind = payload
        .get("type")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BillingError::MalformedPayload("missing event type".to_string()))?
        .to_string();
    let livemode = payload
        .get("livemode")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    Ok(Notification {
        stripe_id,
        kind,
        livemode,
        payload,
    })
}

/// Webhook ingestion entry point used by the HTTP endpoint and by
/// operator replay.
pub struct WebhookIngestor {
    events: EventStore,
    exceptions: ExceptionLog,
    dispatcher: Dispatcher,
    webhook_secret: String,
}

impl WebhookIngestor {
    pub fn new(
        events: EventStore,
        exceptions: ExceptionLog,
        dispatcher: Dispatcher,
        webhook_secret: String,
    ) -> Self {
        Self {
            events,
            exceptions,
            dispatcher,
            webhook_secret,
        }
    }

    /// Verify the `Stripe-Signature` header against the raw body.
    ///
    /// Parses the `t=timestamp,v1=signature` header format and recomputes
    /// the HMAC over `"{timestamp}.{payload}"`. Skipped (with a log line)
    /// when no signing secret is configured.
    pub fn verify_signature(&self, payload: &str, signature: &str) -> BillingResult<()> {
        if self.webhook_secret.is_empty() {
            tracing::debug!("Webhook signature verification skipped (no secret configured)");
            return Ok(());
        }

        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;
        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| BillingError::WebhookSignatureInvalid)?
            .as_secs() as i64;
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                "Webhook signature timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        // The secret's "whsec_" prefix is not part of the key material.
        let secret_key = self
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(())
    }

    /// Run one notification through the ingestion state machine.
    ///
    /// Infallible by design: past parsing, every failure is logged and
    /// absorbed so the HTTP endpoint can answer success unconditionally.
    pub async fn ingest(&self, notification: Notification) -> IngestOutcome {
        // Fast path: already seen. This check is an optimization; the
        // record step below is what actually guarantees uniqueness, so a
        // failed pre-check just falls through to it.
        match self.events.is_duplicate(&notification.stripe_id).await {
            Ok(true) => {
                self.log_duplicate(&notification).await;
                return IngestOutcome::Duplicate;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    event_id = %notification.stripe_id,
                    error = %e,
                    "Duplicate pre-check failed, relying on the storage constraint"
                );
            }
        }

        let event = match self
            .events
            .record(
                &notification.stripe_id,
                &notification.kind,
                notification.livemode,
                notification.payload.clone(),
            )
            .await
        {
            Ok(event) => event,
            Err(BillingError::DuplicateEvent(_)) => {
                // Lost the race against a concurrent delivery of the same
                // id. Identical to the pre-check branch.
                self.log_duplicate(&notification).await;
                return IngestOutcome::Duplicate;
            }
            Err(e) => {
                // The event could not be durably recorded. Preserve the
                // payload in the exception log so the delivery stays
                // recoverable, and still answer success upstream.
                tracing::error!(
                    event_id = %notification.stripe_id,
                    error = %e,
                    "Failed to record webhook event"
                );
                self.log_exception(
                    notification.payload.clone(),
                    "Failed to record event",
                    None,
                    Some(e.to_string()),
                )
                .await;
                return IngestOutcome::Failed;
            }
        };

        tracing::info!(
            event_id = %event.stripe_id,
            kind = %event.kind,
            livemode = event.livemode,
            "Webhook event recorded"
        );

        match self.dispatcher.dispatch(&event).await {
            Ok(validated) => {
                if let Err(e) = self.events.mark_processed(event.id, Some(validated)).await {
                    tracing::error!(
                        event_id = %event.stripe_id,
                        error = %e,
                        "Handler succeeded but event could not be marked processed"
                    );
                }
                IngestOutcome::Processed
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %event.stripe_id,
                    kind = %event.kind,
                    error = %e,
                    "Event handler failed, recorded for manual replay"
                );
                self.log_exception(
                    event.message.clone(),
                    &format!("Event handler failed: {e}"),
                    Some(event.id),
                    Some(format!("{e:?}")),
                )
                .await;
                IngestOutcome::Failed
            }
        }
    }

    /// Re-run a stored event's handler from its stored payload.
    ///
    /// Operator action for events whose handler failed (e.g. a reference
    /// that arrived out of order and has since been backfilled). No new
    /// delivery is needed: the raw message was kept at ingest time.
    pub async fn replay(&self, stripe_id: &str) -> BillingResult<ReplayResult> {
        let event = self
            .events
            .find(stripe_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("event {stripe_id}")))?;

        let previously_processed = event.processed;
        tracing::info!(
            event_id = %stripe_id,
            kind = %event.kind,
            previously_processed = previously_processed,
            "Replaying stored webhook event"
        );

        match self.dispatcher.dispatch(&event).await {
            Ok(validated) => {
                self.events.mark_processed(event.id, Some(validated)).await?;
                Ok(ReplayResult {
                    stripe_id: stripe_id.to_string(),
                    kind: event.kind,
                    previously_processed,
                    success: true,
                    error: None,
                })
            }
            Err(e) => {
                self.log_exception(
                    event.message.clone(),
                    &format!("Replay failed: {e}"),
                    Some(event.id),
                    Some(format!("{e:?}")),
                )
                .await;
                Ok(ReplayResult {
                    stripe_id: stripe_id.to_string(),
                    kind: event.kind,
                    previously_processed,
                    success: false,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    pub async fn recent_events(&self, limit: i64) -> BillingResult<Vec<EventRecord>> {
        self.events.list_recent(limit).await
    }

    pub async fn unprocessed_events(&self, limit: i64) -> BillingResult<Vec<EventRecord>> {
        self.events.list_unprocessed(limit).await
    }

    pub async fn recent_exceptions(&self, limit: i64) -> BillingResult<Vec<ExceptionRecord>> {
        self.exceptions.list_recent(limit).await
    }

    async fn log_duplicate(&self, notification: &Notification) {
        tracing::info!(
            event_id = %notification.stripe_id,
            kind = %notification.kind,
            "Duplicate webhook delivery"
        );
        self.log_exception(
            notification.payload.clone(),
            "Duplicate event record",
            None,
            None,
        )
        .await;
    }

    /// Best-effort exception write: a storage failure here is logged and
    /// swallowed so it can never escalate into a processor retry storm.
    async fn log_exception(
        &self,
        data: serde_json::Value,
        message: &str,
        event_id: Option<Uuid>,
        traceback: Option<String>,
    ) {
        if let Err(e) = self.exceptions.log(data, message, event_id, traceback).await {
            tracing::error!(
                error = %e,
                detail = message,
                "Failed to write event processing exception"
            );
        }
    }
}
