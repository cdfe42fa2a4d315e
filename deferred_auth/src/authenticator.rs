//! User name and password authentication

use std::{fmt, sync::Arc};

use deferred_auth_traits::{AsyncValidator, SyncValidator};

use crate::{
    carrier::PendingOutcomeCarrier,
    context::{AuthorizationPolicies, UserNamePolicy},
    error::AuthenticationError,
};

/// The validator configured for user name and password credentials
#[derive(Clone)]
pub enum CredentialValidator {
    /// A validator that answers before returning
    Sync(Arc<dyn SyncValidator>),
    /// A validator that may answer after returning
    Async(Arc<dyn AsyncValidator>),
}

impl CredentialValidator {
    /// Wraps a synchronous validator
    pub fn from_sync<V>(validator: V) -> Self
    where
        V: SyncValidator + 'static,
    {
        Self::Sync(Arc::new(validator))
    }

    /// Wraps an asynchronous validator
    pub fn from_async<V>(validator: V) -> Self
    where
        V: AsyncValidator + 'static,
    {
        Self::Async(Arc::new(validator))
    }

    /// Whether the validator may defer its verdict
    #[inline]
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("CredentialValidator::Sync"),
            Self::Async(_) => f.write_str("CredentialValidator::Async"),
        }
    }
}

/// Authenticates user name and password credentials, producing the
/// authorization policies for the call
///
/// When an asynchronous validator has not reached a verdict by the time it
/// returns, authentication succeeds provisionally. The policies then carry
/// the pending outcome so that dispatch can wait on it before the handler
/// runs.
#[derive(Clone, Debug)]
pub struct UserNameAuthenticator {
    validator: CredentialValidator,
}

impl UserNameAuthenticator {
    /// Constructs an authenticator around the given validator
    pub fn new(validator: CredentialValidator) -> Self {
        Self { validator }
    }

    /// The configured validator
    #[inline]
    pub fn validator(&self) -> &CredentialValidator {
        &self.validator
    }

    /// Authenticates the credentials
    ///
    /// # Errors
    ///
    /// Returns [`AuthenticationError::Rejected`] if the validator rejects the
    /// credentials before returning
    #[tracing::instrument(level = "debug", skip(self, password))]
    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthorizationPolicies, AuthenticationError> {
        let policies: AuthorizationPolicies = vec![Arc::new(UserNamePolicy::new(username))];

        match &self.validator {
            CredentialValidator::Sync(validator) => {
                validator.validate(username, password).map_err(|err| {
                    tracing::debug!(error = %err, "credentials rejected");
                    AuthenticationError::Rejected(err)
                })?;
                Ok(policies)
            }
            CredentialValidator::Async(validator) => {
                validate_core(validator.as_ref(), username, password, policies)
            }
        }
    }
}

fn validate_core(
    validator: &dyn AsyncValidator,
    username: &str,
    password: &str,
    mut policies: AuthorizationPolicies,
) -> Result<AuthorizationPolicies, AuthenticationError> {
    let outcome = validator.validate(username, password);

    match outcome.peek() {
        Some(Ok(())) => {
            tracing::trace!("validation settled before returning");
            Ok(policies)
        }
        Some(Err(err)) => {
            tracing::debug!(error = %err, "credentials rejected before returning");
            Err(AuthenticationError::Rejected(err))
        }
        None => {
            tracing::debug!("validation pending, deferring verdict to dispatch");
            policies.push(Arc::new(PendingOutcomeCarrier::new(outcome)));
            Ok(policies)
        }
    }
}
