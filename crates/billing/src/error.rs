//! Billing error taxonomy.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// An event with this processor id has already been recorded. Raised by
    /// the event store when the unique constraint absorbs a duplicate
    /// delivery; callers collapse it into the logged-duplicate branch.
    #[error("duplicate event: {0}")]
    DuplicateEvent(String),

    /// The webhook body could not be decoded into a notification.
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// The Stripe-Signature header failed verification.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// A handler referenced a customer mirror that does not exist locally
    /// yet. Recoverable: the event stays recorded for manual replay.
    #[error("customer not found: {0}")]
    CustomerNotFound(String),

    /// A known event kind carried a payload that does not match the shape
    /// its handler expects.
    #[error("payload validation failed for {kind}: {detail}")]
    PayloadValidation { kind: String, detail: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Error surfaced by the payment processor (declined card, invalid
    /// token, rate limit). The REST layer maps these to 4xx responses.
    #[error("stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("email delivery failed: {0}")]
    Email(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether this error came from the processor and should surface to a
    /// REST caller as a client error rather than a server fault.
    pub fn is_processor_error(&self) -> bool {
        matches!(self, BillingError::Stripe(_))
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::MalformedPayload(e.to_string())
    }
}
