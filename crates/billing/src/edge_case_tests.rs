// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Webhook Ingestion
//!
//! Tests critical boundary conditions and race conditions in:
//! - Notification parsing
//! - Handler dispatch mapping
//! - Signature verification
//! - The ingestion pipeline (duplicates, races, handler failures, replay)
//! - Event store and exception log semantics
//!
//! The pipeline tests run against the in-memory store backends; the
//! database pool is constructed lazily and is never connected unless a
//! handler actually needs it.

use std::sync::Arc;
use std::time::Duration;

use crate::client::{StripeClient, StripeConfig};
use crate::dispatch::Dispatcher;
use crate::email::ReceiptEmailService;
use crate::events::EventStore;
use crate::exceptions::ExceptionLog;
use crate::hooks::DefaultHooks;
use crate::webhooks::WebhookIngestor;

fn lazy_pool() -> sqlx::PgPool {
    sqlx::postgres::PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(100))
        .connect_lazy("postgres://127.0.0.1:1/billbridge_test")
        .unwrap()
}

fn test_config(webhook_secret: &str) -> StripeConfig {
    StripeConfig {
        secret_key: "sk_test_12345".to_string(),
        webhook_secret: webhook_secret.to_string(),
        default_trial_days: None,
    }
}

fn test_dispatcher() -> Dispatcher {
    Dispatcher::new(
        StripeClient::new(test_config("")),
        lazy_pool(),
        ReceiptEmailService::new(None, "http://127.0.0.1:1/emails".into(), "billing@test".into()),
        Arc::new(DefaultHooks::default()),
    )
}

/// Ingestor over in-memory backends, plus handles to inspect them.
fn test_ingestor(webhook_secret: &str) -> (WebhookIngestor, EventStore, ExceptionLog) {
    let events = EventStore::new_in_memory();
    let exceptions = ExceptionLog::new_in_memory();
    let ingestor = WebhookIngestor::new(
        events.clone(),
        exceptions.clone(),
        test_dispatcher(),
        webhook_secret.to_string(),
    );
    (ingestor, events, exceptions)
}

#[cfg(test)]
mod parse_tests {
    use crate::error::BillingError;
    use crate::webhooks::parse_notification;

    #[test]
    fn rejects_non_json_body() {
        let err = parse_notification("this is not json").unwrap_err();
        assert!(matches!(err, BillingError::MalformedPayload(_)));
    }

    #[test]
    fn rejects_body_without_id() {
        let err =
            parse_notification(r#"{"type": "customer.created", "livemode": false}"#).unwrap_err();
        assert!(matches!(err, BillingError::MalformedPayload(_)));
    }

    #[test]
    fn rejects_body_without_type() {
        let err = parse_notification(r#"{"id": "evt_1", "livemode": false}"#).unwrap_err();
        assert!(matches!(err, BillingError::MalformedPayload(_)));
    }

    #[test]
    fn rejects_empty_id() {
        let err = parse_notification(r#"{"id": "", "type": "customer.created"}"#).unwrap_err();
        assert!(matches!(err, BillingError::MalformedPayload(_)));
    }

    #[test]
    fn parses_minimal_notification() {
        let note = parse_notification(
            r#"{"id": "evt_1", "type": "customer.created", "livemode": true, "data": {"object": {}}}"#,
        )
        .unwrap();
        assert_eq!(note.stripe_id, "evt_1");
        assert_eq!(note.kind, "customer.created");
        assert!(note.livemode);
    }

    #[test]
    fn livemode_defaults_to_false() {
        let note = parse_notification(r#"{"id": "evt_2", "type": "charge.succeeded"}"#).unwrap();
        assert!(!note.livemode);
    }
}

#[cfg(test)]
mod dispatch_mapping_tests {
    use crate::dispatch::HandlerKind;

    #[test]
    fn customer_lifecycle_kinds_map_to_customer_handler() {
        for kind in ["customer.created", "customer.updated", "customer.deleted"] {
            assert_eq!(HandlerKind::for_kind(kind), HandlerKind::Customer, "{kind}");
        }
    }

    #[test]
    fn subscription_kinds_map_to_subscription_handler() {
        for kind in [
            "customer.subscription.created",
            "customer.subscription.updated",
            "customer.subscription.deleted",
            "customer.subscription.trial_will_end",
        ] {
            assert_eq!(
                HandlerKind::for_kind(kind),
                HandlerKind::Subscription,
                "{kind}"
            );
        }
    }

    #[test]
    fn card_kinds_map_to_card_handler() {
        for kind in [
            "customer.source.created",
            "customer.source.updated",
            "customer.source.deleted",
            "customer.card.created",
        ] {
            assert_eq!(HandlerKind::for_kind(kind), HandlerKind::Card, "{kind}");
        }
    }

    #[test]
    fn invoice_family_mapping() {
        assert_eq!(
            HandlerKind::for_kind("invoice.payment_succeeded"),
            HandlerKind::Invoice
        );
        assert_eq!(HandlerKind::for_kind("invoice.created"), HandlerKind::Invoice);
        assert_eq!(
            HandlerKind::for_kind("invoiceitem.created"),
            HandlerKind::InvoiceItem
        );
    }

    #[test]
    fn charge_and_transfer_mapping() {
        assert_eq!(HandlerKind::for_kind("charge.succeeded"), HandlerKind::Charge);
        assert_eq!(
            HandlerKind::for_kind("charge.dispute.created"),
            HandlerKind::Charge
        );
        assert_eq!(HandlerKind::for_kind("transfer.paid"), HandlerKind::Transfer);
    }

    #[test]
    fn unknown_kinds_fall_through_to_noop() {
        for kind in [
            "plugh.frobbed",
            "payment_intent.succeeded",
            "customer.discount.created",
            "account.updated",
            "",
        ] {
            assert_eq!(HandlerKind::for_kind(kind), HandlerKind::NoOp, "{kind:?}");
        }
    }
}

#[cfg(test)]
mod signature_tests {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    use super::test_ingestor;
    use crate::error::BillingError;

    const SECRET: &str = "whsec_testsecret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let key = SECRET.strip_prefix("whsec_").unwrap();
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[tokio::test]
    async fn accepts_valid_signature() {
        let (ingestor, _, _) = test_ingestor(SECRET);
        let payload = r#"{"id":"evt_1","type":"customer.created"}"#;
        let header = sign(payload, now());
        assert!(ingestor.verify_signature(payload, &header).is_ok());
    }

    #[tokio::test]
    async fn rejects_tampered_payload() {
        let (ingestor, _, _) = test_ingestor(SECRET);
        let header = sign(r#"{"id":"evt_1"}"#, now());
        let err = ingestor
            .verify_signature(r#"{"id":"evt_2"}"#, &header)
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[tokio::test]
    async fn rejects_stale_timestamp() {
        let (ingestor, _, _) = test_ingestor(SECRET);
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, now() - 301);
        let err = ingestor.verify_signature(payload, &header).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[tokio::test]
    async fn accepts_timestamp_at_tolerance_boundary() {
        let (ingestor, _, _) = test_ingestor(SECRET);
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, now() - 299);
        assert!(ingestor.verify_signature(payload, &header).is_ok());
    }

    #[tokio::test]
    async fn rejects_header_without_signature_part() {
        let (ingestor, _, _) = test_ingestor(SECRET);
        let err = ingestor
            .verify_signature(r#"{"id":"evt_1"}"#, "t=12345")
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[tokio::test]
    async fn skips_verification_without_secret() {
        let (ingestor, _, _) = test_ingestor("");
        assert!(ingestor.verify_signature("{}", "garbage").is_ok());
    }
}

#[cfg(test)]
mod ingest_pipeline_tests {
    use std::sync::Arc;

    use tokio::sync::Barrier;

    use super::test_ingestor;
    use crate::webhooks::{parse_notification, IngestOutcome};

    fn notification(id: &str, kind: &str) -> crate::webhooks::Notification {
        parse_notification(&format!(
            r#"{{"id": "{id}", "type": "{kind}", "livemode": false, "data": {{"object": {{}}}}}}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn unrecognized_kind_is_recorded_and_processed() {
        let (ingestor, events, exceptions) = test_ingestor("");

        let outcome = ingestor.ingest(notification("evt_1", "plugh.frobbed")).await;

        assert_eq!(outcome, IngestOutcome::Processed);
        let stored = events.find("evt_1").await.unwrap().unwrap();
        assert!(stored.processed);
        assert!(stored.processed_at.is_some());
        assert!(exceptions.list_recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn redelivery_is_logged_as_duplicate() {
        let (ingestor, events, exceptions) = test_ingestor("");

        let first = ingestor.ingest(notification("evt_dup", "mystery.kind")).await;
        let second = ingestor.ingest(notification("evt_dup", "mystery.kind")).await;

        assert_eq!(first, IngestOutcome::Processed);
        assert_eq!(second, IngestOutcome::Duplicate);

        // Still exactly one stored event, still processed.
        assert_eq!(events.list_recent(10).await.unwrap().len(), 1);
        assert!(events.find("evt_dup").await.unwrap().unwrap().processed);

        let logged = exceptions.list_recent(10).await.unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].message, "Duplicate event record");
        assert!(logged[0].data.is_some());
    }

    #[tokio::test]
    async fn concurrent_deliveries_of_one_id_store_exactly_one_event() {
        const DELIVERIES: usize = 8;

        let (ingestor, events, exceptions) = test_ingestor("");
        let ingestor = Arc::new(ingestor);
        let barrier = Arc::new(Barrier::new(DELIVERIES));

        let mut handles = vec![];
        for _ in 0..DELIVERIES {
            let ingestor = Arc::clone(&ingestor);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ingestor.ingest(notification("evt_race", "mystery.kind")).await
            }));
        }

        let mut outcomes = vec![];
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        let processed = outcomes
            .iter()
            .filter(|o| **o == IngestOutcome::Processed)
            .count();
        let duplicates = outcomes
            .iter()
            .filter(|o| **o == IngestOutcome::Duplicate)
            .count();

        assert_eq!(processed, 1, "exactly one delivery wins the race");
        assert_eq!(
            duplicates,
            DELIVERIES - 1,
            "all others collapse to duplicates"
        );
        assert_eq!(events.list_recent(20).await.unwrap().len(), 1);
        assert_eq!(
            exceptions.list_recent(20).await.unwrap().len(),
            DELIVERIES - 1
        );
    }

    #[tokio::test]
    async fn handler_validation_failure_keeps_event_and_logs_exception() {
        let (ingestor, events, exceptions) = test_ingestor("");

        // Known kind with a payload missing data.object: the handler
        // rejects it before touching any mirror.
        let note = parse_notification(
            r#"{"id": "evt_bad", "type": "customer.created", "livemode": false}"#,
        )
        .unwrap();
        let outcome = ingestor.ingest(note).await;

        assert_eq!(outcome, IngestOutcome::Failed);

        let stored = events.find("evt_bad").await.unwrap().unwrap();
        assert!(!stored.processed, "failed events stay unprocessed");

        let logged = exceptions.list_recent(10).await.unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].event_id, Some(stored.id));
        assert!(logged[0].message.contains("Event handler failed"));
        assert!(logged[0].traceback.is_some());
    }

    #[tokio::test]
    async fn replay_reuses_the_stored_payload() {
        let (ingestor, events, _exceptions) = test_ingestor("");

        ingestor.ingest(notification("evt_replay", "mystery.kind")).await;

        let result = ingestor.replay("evt_replay").await.unwrap();
        assert!(result.success);
        assert!(result.previously_processed);
        assert_eq!(result.kind, "mystery.kind");
        assert!(events.find("evt_replay").await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn replay_of_failed_event_reports_the_error() {
        let (ingestor, events, exceptions) = test_ingestor("");

        let note = parse_notification(
            r#"{"id": "evt_still_bad", "type": "customer.created", "livemode": false}"#,
        )
        .unwrap();
        ingestor.ingest(note).await;

        let result = ingestor.replay("evt_still_bad").await.unwrap();
        assert!(!result.success);
        assert!(!result.previously_processed);
        assert!(result.error.is_some());

        // One exception from ingest, one from the failed replay.
        assert_eq!(exceptions.list_recent(10).await.unwrap().len(), 2);
        assert!(!events.find("evt_still_bad").await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn replay_of_unknown_event_is_not_found() {
        let (ingestor, _, _) = test_ingestor("");
        let err = ingestor.replay("evt_missing").await.unwrap_err();
        assert!(matches!(err, crate::error::BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn unprocessed_listing_only_shows_failed_events() {
        let (ingestor, _, _) = test_ingestor("");

        ingestor.ingest(notification("evt_ok", "mystery.kind")).await;
        let bad = parse_notification(
            r#"{"id": "evt_fail", "type": "customer.created", "livemode": false}"#,
        )
        .unwrap();
        ingestor.ingest(bad).await;

        let unprocessed = ingestor.unprocessed_events(10).await.unwrap();
        assert_eq!(unprocessed.len(), 1);
        assert_eq!(unprocessed[0].stripe_id, "evt_fail");
    }
}

#[cfg(test)]
mod event_store_tests {
    use serde_json::json;

    use crate::error::BillingError;
    use crate::events::EventStore;

    #[tokio::test]
    async fn record_enforces_uniqueness() {
        let store = EventStore::new_in_memory();

        store
            .record("evt_1", "customer.created", false, json!({}))
            .await
            .unwrap();
        let err = store
            .record("evt_1", "customer.created", false, json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::DuplicateEvent(id) if id == "evt_1"));
    }

    #[tokio::test]
    async fn is_duplicate_reflects_recorded_state() {
        let store = EventStore::new_in_memory();
        assert!(!store.is_duplicate("evt_1").await.unwrap());
        store
            .record("evt_1", "charge.succeeded", true, json!({}))
            .await
            .unwrap();
        assert!(store.is_duplicate("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn mark_processed_is_idempotent() {
        let store = EventStore::new_in_memory();
        let event = store
            .record("evt_1", "charge.succeeded", false, json!({}))
            .await
            .unwrap();

        store
            .mark_processed(event.id, Some(json!({"ok": true})))
            .await
            .unwrap();
        let first = store.find("evt_1").await.unwrap().unwrap();

        store.mark_processed(event.id, None).await.unwrap();
        let second = store.find("evt_1").await.unwrap().unwrap();

        assert!(first.processed && second.processed);
        assert_eq!(first.processed_at, second.processed_at);
        assert_eq!(second.validated_message, Some(json!({"ok": true})));
    }
}

#[cfg(test)]
mod exception_log_tests {
    use serde_json::json;
    use uuid::Uuid;

    use crate::exceptions::ExceptionLog;

    #[tokio::test]
    async fn log_and_list() {
        let log = ExceptionLog::new_in_memory();
        log.log(json!({"id": "evt_1"}), "Duplicate event record", None, None)
            .await
            .unwrap();
        log.log(
            json!({"id": "evt_2"}),
            "Event handler failed: boom",
            None,
            Some("trace".to_string()),
        )
        .await
        .unwrap();

        let recent = log.list_recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);

        let limited = log.list_recent(1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn list_for_event_filters_by_event() {
        let log = ExceptionLog::new_in_memory();
        let event_id = Uuid::new_v4();
        log.log(json!({}), "Event handler failed: a", Some(event_id), None)
            .await
            .unwrap();
        log.log(json!({}), "Duplicate event record", None, None)
            .await
            .unwrap();

        let for_event = log.list_for_event(event_id).await.unwrap();
        assert_eq!(for_event.len(), 1);
        assert_eq!(for_event[0].event_id, Some(event_id));
    }
}

#[cfg(test)]
mod dispatcher_tests {
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::test_dispatcher;
    use crate::error::BillingError;
    use crate::events::EventRecord;

    fn event(kind: &str, message: serde_json::Value) -> EventRecord {
        EventRecord {
            id: Uuid::new_v4(),
            stripe_id: "evt_test".to_string(),
            kind: kind.to_string(),
            livemode: false,
            message,
            validated_message: None,
            received_at: OffsetDateTime::now_utc(),
            processed: false,
            processed_at: None,
        }
    }

    #[tokio::test]
    async fn unknown_kind_dispatches_to_noop() {
        let dispatcher = test_dispatcher();
        let validated = dispatcher
            .dispatch(&event("totally.unknown", json!({"data": {"object": {}}})))
            .await
            .unwrap();
        assert_eq!(validated, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn missing_object_is_a_validation_failure() {
        let dispatcher = test_dispatcher();
        let err = dispatcher
            .dispatch(&event("customer.created", json!({"id": "evt_test"})))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PayloadValidation { .. }));
    }

    #[tokio::test]
    async fn wrong_object_shape_is_a_validation_failure() {
        let dispatcher = test_dispatcher();
        // Subscription payload without the required customer/status fields.
        let err = dispatcher
            .dispatch(&event(
                "customer.subscription.updated",
                json!({"data": {"object": {"id": "sub_1"}}}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PayloadValidation { .. }));
    }
}

#[cfg(test)]
mod hooks_tests {
    use std::sync::Arc;

    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::customers::CustomerRecord;
    use crate::hooks::{BillingHooks, DefaultHooks};

    fn customer() -> CustomerRecord {
        CustomerRecord {
            id: Uuid::new_v4(),
            account_id: None,
            stripe_id: "cus_test".to_string(),
            email: Some("user@example.com".to_string()),
            currency: Some("usd".to_string()),
            delinquent: false,
            deleted: false,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn default_hooks_have_no_trial_unless_configured() {
        let hooks = DefaultHooks::default();
        assert_eq!(hooks.trial_period(&customer(), "price_pro"), None);

        let hooks = DefaultHooks::new(Some(14));
        assert_eq!(hooks.trial_period(&customer(), "price_pro"), Some(14));
    }

    #[test]
    fn default_hooks_pass_quantity_through() {
        let hooks = DefaultHooks::default();
        assert_eq!(
            hooks.adjust_subscription_quantity(&customer(), "price_pro", 3),
            3
        );
    }

    /// Deployment override, the reason the hooks are a trait object.
    struct SeatFloorHooks;

    impl BillingHooks for SeatFloorHooks {
        fn trial_period(&self, _customer: &CustomerRecord, _plan: &str) -> Option<u32> {
            Some(3)
        }

        fn adjust_subscription_quantity(
            &self,
            _customer: &CustomerRecord,
            _plan: &str,
            quantity: u64,
        ) -> u64 {
            quantity.max(4)
        }
    }

    #[test]
    fn custom_hooks_override_policy() {
        let hooks: Arc<dyn BillingHooks> = Arc::new(SeatFloorHooks);
        assert_eq!(hooks.trial_period(&customer(), "price_pro"), Some(3));
        assert_eq!(
            hooks.adjust_subscription_quantity(&customer(), "price_pro", 1),
            4
        );
        assert_eq!(
            hooks.adjust_subscription_quantity(&customer(), "price_pro", 9),
            9
        );
    }
}
