//! Carries a pending validation outcome from authentication into dispatch

use deferred_auth_traits::ValidationOutcome;

use crate::context::{AuthorizationPolicy, EvaluationContext, PENDING_AUTHORIZATION_TASK};

/// An authorization policy whose only effect is to deposit a pending
/// validation outcome into the call's properties
///
/// The carrier asserts no claims and grants nothing on its own. Evaluating
/// it stores the outcome under [`PENDING_AUTHORIZATION_TASK`], where the
/// completion invoker picks it up before running the handler.
#[derive(Clone, Debug)]
pub struct PendingOutcomeCarrier {
    outcome: ValidationOutcome,
}

impl PendingOutcomeCarrier {
    /// Wraps a pending outcome
    pub fn new(outcome: ValidationOutcome) -> Self {
        Self { outcome }
    }

    /// The outcome being carried
    #[inline]
    pub fn outcome(&self) -> &ValidationOutcome {
        &self.outcome
    }
}

impl AuthorizationPolicy for PendingOutcomeCarrier {
    fn id(&self) -> &str {
        "pending-validation"
    }

    fn evaluate(&self, context: &mut EvaluationContext<'_>) {
        let replaced = context
            .properties_mut()
            .insert(PENDING_AUTHORIZATION_TASK, self.outcome.clone());

        if replaced {
            tracing::warn!("replaced a pending validation outcome already attached to the call");
        } else {
            tracing::trace!("pending validation outcome attached to the call");
        }
    }
}
