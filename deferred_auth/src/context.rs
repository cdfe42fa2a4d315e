//! Per-call state shared between the authentication and dispatch phases

use std::{
    any::{self, Any},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use deferred_auth_traits::ValidationOutcome;
use thiserror::Error;

use crate::error::BridgeError;

/// Reserved property under which a still-pending validation outcome travels
/// from authentication to dispatch
///
/// Only the pending-outcome carrier writes this key and only the completion
/// invoker reads it. When the key is absent there is no pending validation.
pub const PENDING_AUTHORIZATION_TASK: &str = "PendingAuthorizationTask";

/// Claim type asserted for the authenticated user name
pub const NAME_CLAIM_TYPE: &str = "name";

/// Indicates that a property exists but holds a value of another type
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("property `{key}` does not hold a value of type `{expected}`")]
pub struct PropertyTypeMismatch {
    key: String,
    expected: &'static str,
}

impl PropertyTypeMismatch {
    /// The key of the mismatched property
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// A bag of named, type-erased properties scoped to a single call
#[derive(Default)]
pub struct Properties {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Properties {
    /// Constructs an empty property bag
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, returning whether an earlier value was
    /// replaced
    pub fn insert<T>(&mut self, key: impl Into<String>, value: T) -> bool
    where
        T: Any + Send + Sync,
    {
        self.values.insert(key.into(), Box::new(value)).is_some()
    }

    /// Borrows the value under `key` if it exists and has type `T`
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref::<T>()
    }

    /// Whether any value is stored under `key`
    #[inline]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Removes and returns the value under `key`
    ///
    /// # Errors
    ///
    /// If a value exists under `key` but is not a `T`, it is left in place
    /// and an error is returned.
    pub fn remove<T: Any>(&mut self, key: &str) -> Result<Option<T>, PropertyTypeMismatch> {
        let Some(value) = self.values.remove(key) else {
            return Ok(None);
        };

        match value.downcast::<T>() {
            Ok(value) => Ok(Some(*value)),
            Err(value) => {
                self.values.insert(key.to_owned(), value);
                Err(PropertyTypeMismatch {
                    key: key.to_owned(),
                    expected: any::type_name::<T>(),
                })
            }
        }
    }

    /// The number of stored properties
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the bag is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// A fact asserted about the caller while authorizing a call
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Claim {
    claim_type: String,
    resource: String,
}

impl Claim {
    /// Constructs a claim
    pub fn new(claim_type: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            claim_type: claim_type.into(),
            resource: resource.into(),
        }
    }

    /// A claim to the given user name
    pub fn name(username: impl Into<String>) -> Self {
        Self::new(NAME_CLAIM_TYPE, username)
    }

    /// The kind of claim
    #[inline]
    pub fn claim_type(&self) -> &str {
        &self.claim_type
    }

    /// The value being claimed
    #[inline]
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

/// The view of a call given to authorization policies while they are
/// evaluated
#[derive(Debug)]
pub struct EvaluationContext<'a> {
    properties: &'a mut Properties,
    claims: &'a mut Vec<Claim>,
}

impl EvaluationContext<'_> {
    /// The call's properties
    #[inline]
    pub fn properties(&self) -> &Properties {
        &*self.properties
    }

    /// Mutable access to the call's properties
    #[inline]
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut *self.properties
    }

    /// Claims asserted so far
    #[inline]
    pub fn claims(&self) -> &[Claim] {
        self.claims.as_slice()
    }

    /// Asserts a claim about the caller
    pub fn add_claim(&mut self, claim: Claim) {
        self.claims.push(claim);
    }
}

/// A fact produced by authentication and evaluated once per call before
/// dispatch
pub trait AuthorizationPolicy: Send + Sync + fmt::Debug {
    /// A stable identifier for the policy
    fn id(&self) -> &str;

    /// Applies the policy to the call
    fn evaluate(&self, context: &mut EvaluationContext<'_>);
}

/// The authorization policies produced for a call
pub type AuthorizationPolicies = Vec<Arc<dyn AuthorizationPolicy>>;

/// Asserts the name claim for a user authenticated by user name and password
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserNamePolicy {
    username: String,
}

impl UserNamePolicy {
    /// Constructs the policy for `username`
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    /// The authenticated user name
    #[inline]
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl AuthorizationPolicy for UserNamePolicy {
    fn id(&self) -> &str {
        "user-name"
    }

    fn evaluate(&self, context: &mut EvaluationContext<'_>) {
        context.add_claim(Claim::name(&self.username));
    }
}

/// State belonging to exactly one inbound call
///
/// A call context is created by the host before authentication runs, moved
/// through dispatch alongside the call, and dropped once the call
/// completes. It is never shared between calls.
#[derive(Debug, Default)]
pub struct CallContext {
    username: Option<String>,
    properties: Properties,
    claims: Vec<Claim>,
}

impl CallContext {
    /// Constructs an anonymous call context
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a call context for an authenticated user
    pub fn for_user(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            ..Self::default()
        }
    }

    /// The authenticated user name, if any
    #[inline]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// The call's properties
    #[inline]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Mutable access to the call's properties
    #[inline]
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Claims asserted while authorizing the call
    #[inline]
    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    /// Evaluates each of the call's authorization policies once
    pub fn authorize(&mut self, policies: &[Arc<dyn AuthorizationPolicy>]) {
        let mut context = EvaluationContext {
            properties: &mut self.properties,
            claims: &mut self.claims,
        };

        for policy in policies {
            tracing::trace!(policy = policy.id(), "evaluating authorization policy");
            policy.evaluate(&mut context);
        }
    }

    /// Takes the pending validation outcome attached during authentication
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::MalformedPendingTask`] if the reserved property
    /// holds something other than a validation outcome.
    pub fn take_pending_outcome(&mut self) -> Result<Option<ValidationOutcome>, BridgeError> {
        self.properties
            .remove::<ValidationOutcome>(PENDING_AUTHORIZATION_TASK)
            .map_err(|err| {
                tracing::error!(property = err.key(), "{err}");
                BridgeError::MalformedPendingTask
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_are_typed() {
        let mut properties = Properties::new();
        assert!(!properties.insert("tenant", String::from("contoso")));
        assert!(properties.insert("tenant", String::from("fabrikam")));

        assert_eq!(
            properties.get::<String>("tenant").map(String::as_str),
            Some("fabrikam")
        );
        assert_eq!(properties.get::<u32>("tenant"), None);
        assert_eq!(properties.len(), 1);
    }

    #[test]
    fn mismatched_remove_leaves_the_value_in_place() {
        let mut properties = Properties::new();
        properties.insert("attempts", 3_u32);

        let err = properties.remove::<String>("attempts").unwrap_err();
        assert_eq!(err.key(), "attempts");
        assert!(properties.contains_key("attempts"));
        assert_eq!(properties.remove::<u32>("attempts"), Ok(Some(3)));
        assert!(properties.is_empty());
    }

    #[test]
    fn user_name_policy_asserts_a_name_claim() {
        let mut call = CallContext::for_user("01");
        let policies: AuthorizationPolicies = vec![Arc::new(UserNamePolicy::new("01"))];

        call.authorize(&policies);

        assert_eq!(call.username(), Some("01"));
        assert_eq!(call.claims(), &[Claim::name("01")]);
        assert!(call.properties().is_empty());
    }

    #[test]
    fn absent_pending_outcome_is_none() {
        let mut call = CallContext::new();
        assert!(call.take_pending_outcome().unwrap().is_none());
    }

    #[test]
    fn pending_outcome_is_taken_once() {
        let mut call = CallContext::new();
        let (_settler, outcome) = ValidationOutcome::channel();
        call.properties_mut()
            .insert(PENDING_AUTHORIZATION_TASK, outcome.clone());

        let taken = call.take_pending_outcome().unwrap().unwrap();
        assert!(taken.ptr_eq(&outcome));
        assert!(call.take_pending_outcome().unwrap().is_none());
    }

    #[test]
    fn malformed_pending_outcome_is_a_bridge_error() {
        let mut call = CallContext::new();
        call.properties_mut()
            .insert(PENDING_AUTHORIZATION_TASK, "not an outcome");

        assert_eq!(
            call.take_pending_outcome().unwrap_err(),
            BridgeError::MalformedPendingTask
        );
    }
}
