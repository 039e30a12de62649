//! Deployment hook points for subscription creation.
//!
//! The dispatcher and subscription service consult an explicit strategy
//! object instead of global settings, so deployments can override trial and
//! quantity policy without touching the services themselves.

use crate::customers::CustomerRecord;

/// Per-deployment billing policy hooks.
///
/// Implementations must be cheap and side-effect free; they are called
/// inline on the subscription-creation path.
pub trait BillingHooks: Send + Sync {
    /// Trial length in days for a new subscription, or `None` for no
    /// trial. Called before the subscription is created with the
    /// processor.
    fn trial_period(&self, customer: &CustomerRecord, plan: &str) -> Option<u32>;

    /// Opportunity to override the requested seat quantity. The returned
    /// value is what gets sent to the processor; it is clamped to at
    /// least 1 by the caller.
    fn adjust_subscription_quantity(
        &self,
        customer: &CustomerRecord,
        plan: &str,
        quantity: u64,
    ) -> u64;
}

/// Default policy: a flat configured trial for every plan, quantity passed
/// through unchanged.
#[derive(Debug, Clone, Default)]
pub struct DefaultHooks {
    pub default_trial_days: Option<u32>,
}

impl DefaultHooks {
    pub fn new(default_trial_days: Option<u32>) -> Self {
        Self { default_trial_days }
    }
}

impl BillingHooks for DefaultHooks {
    fn trial_period(&self, _customer: &CustomerRecord, _plan: &str) -> Option<u32> {
        self.default_trial_days
    }

    fn adjust_subscription_quantity(
        &self,
        _customer: &CustomerRecord,
        _plan: &str,
        quantity: u64,
    ) -> u64 {
        quantity
    }
}
