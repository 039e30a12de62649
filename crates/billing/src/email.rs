//! Receipt email delivery.
//!
//! Sends payment receipts through the Resend HTTP API. The service is
//! optional: without `RESEND_API_KEY` every send is a logged no-op, which
//! keeps self-hosted deployments working without an email provider.

use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};

const DEFAULT_API_URL: &str = "https://api.resend.com/emails";

#[derive(Clone)]
pub struct ReceiptEmailService {
    client: reqwest::Client,
    api_key: Option<String>,
    api_url: String,
    from_address: String,
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

impl ReceiptEmailService {
    pub fn from_env() -> Self {
        let api_key = std::env::var("RESEND_API_KEY").ok().filter(|k| !k.is_empty());
        let api_url =
            std::env::var("RECEIPT_EMAIL_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let from_address = std::env::var("RECEIPT_FROM_EMAIL")
            .unwrap_or_else(|_| "billing@billbridge.dev".to_string());

        Self {
            client: reqwest::Client::new(),
            api_key,
            api_url,
            from_address,
        }
    }

    /// Construct a service pointed at an explicit endpoint. Used by tests.
    pub fn new(api_key: Option<String>, api_url: String, from_address: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            api_url,
            from_address,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Send a payment receipt. Returns `Ok(false)` when the service is not
    /// configured, `Ok(true)` after a successful delivery.
    pub async fn send_receipt(
        &self,
        to: &str,
        amount_cents: i64,
        currency: &str,
        description: Option<&str>,
    ) -> BillingResult<bool> {
        let Some(api_key) = &self.api_key else {
            tracing::info!(to = %to, "Receipt email skipped (email service not configured)");
            return Ok(false);
        };

        let subject = format!(
            "Your receipt: {} {:.2}",
            currency.to_uppercase(),
            amount_cents as f64 / 100.0
        );
        let body = match description {
            Some(desc) => format!(
                "Thanks for your payment of {} {:.2} for {}.",
                currency.to_uppercase(),
                amount_cents as f64 / 100.0,
                desc
            ),
            None => format!(
                "Thanks for your payment of {} {:.2}.",
                currency.to_uppercase(),
                amount_cents as f64 / 100.0
            ),
        };

        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);
        let response = Retry::spawn(strategy, || async {
            self.client
                .post(&self.api_url)
                .bearer_auth(api_key)
                .json(&SendEmailRequest {
                    from: &self.from_address,
                    to: [to],
                    subject: &subject,
                    text: &body,
                })
                .send()
                .await
                .and_then(|r| r.error_for_status())
        })
        .await
        .map_err(|e| BillingError::Email(e.to_string()))?;

        tracing::info!(
            to = %to,
            status = %response.status(),
            amount_cents = amount_cents,
            "Receipt email sent"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn disabled_service_skips_send() {
        let service = ReceiptEmailService::new(None, "http://127.0.0.1:1/emails".into(), "x@y".into());
        let sent = service.send_receipt("user@example.com", 1500, "usd", None).await.unwrap();
        assert!(!sent);
        assert!(!service.is_enabled());
    }

    #[tokio::test]
    async fn sends_through_http_api() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_body(r#"{"id":"email_1"}"#)
            .expect(1)
            .create_async()
            .await;

        let service = ReceiptEmailService::new(
            Some("test-key".into()),
            format!("{}/emails", server.url()),
            "billing@test".into(),
        );
        let sent = service
            .send_receipt("user@example.com", 2500, "usd", Some("Pro plan"))
            .await
            .unwrap();

        assert!(sent);
        mock.assert_async().await;
    }
}
