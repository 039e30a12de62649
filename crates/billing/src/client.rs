//! Stripe client wrapper and configuration.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};

/// Stripe configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Secret API key (`sk_live_...` / `sk_test_...`).
    pub secret_key: String,
    /// Webhook signing secret (`whsec_...`). Empty disables signature
    /// verification, which is only acceptable for local development.
    pub webhook_secret: String,
    /// Default trial length applied by [`crate::hooks::DefaultHooks`].
    pub default_trial_days: Option<u32>,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default();
        let default_trial_days = std::env::var("DEFAULT_TRIAL_DAYS")
            .ok()
            .and_then(|v| v.parse().ok());

        if webhook_secret.is_empty() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set - webhook signatures will not be verified");
        }

        Ok(Self {
            secret_key,
            webhook_secret,
            default_trial_days,
        })
    }
}

/// Thin wrapper over [`stripe::Client`] carrying the config alongside it.
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// Access the underlying client for API calls.
    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
