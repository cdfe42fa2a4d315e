//! Errors raised while authenticating and dispatching a call

use std::error;

use deferred_auth_traits::ValidationError;
use thiserror::Error;

use crate::fault::{FaultError, FaultRecord};

/// An error boxed up by a request handler
pub type HandlerError = Box<dyn error::Error + Send + Sync + 'static>;

/// Indicates that a call was rejected during the authentication phase,
/// before any dispatch took place
///
/// A validator whose outcome had already failed by the time authentication
/// ran is reported here, exactly like a synchronous validator, rather than
/// as a [`FaultRecord`]. Only failures observed after dispatch began are
/// translated into faults.
#[derive(Clone, Debug, Error)]
pub enum AuthenticationError {
    /// The validator rejected the credentials
    #[error(transparent)]
    Rejected(#[from] ValidationError),
}

impl AuthenticationError {
    /// The validator's rejection
    #[inline]
    pub fn validation_error(&self) -> &ValidationError {
        match self {
            Self::Rejected(err) => err,
        }
    }
}

/// Defects in the bridge itself
///
/// These indicate programming errors. They are never retried and never
/// translated into faults.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The reserved pending-validation property held something other than a
    /// validation outcome
    #[error("the pending authorization property does not hold a validation outcome")]
    MalformedPendingTask,
    /// The result of an invocation was requested before it completed
    #[error("invocation result requested before the invocation completed")]
    EndBeforeCompletion,
    /// The result of an invocation was requested more than once
    #[error("invocation result has already been taken")]
    AlreadyEnded,
    /// An invocation was dropped without ever producing a result
    #[error("invocation was abandoned before it completed")]
    Abandoned,
}

/// An error raised while invoking an operation
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The credentials were rejected after dispatch began
    #[error(transparent)]
    Fault(#[from] FaultError),
    /// The handler itself failed; the original error is passed through
    /// untouched
    #[error(transparent)]
    Handler(HandlerError),
    /// The bridge encountered a defect
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl InvokeError {
    /// The fault returned to the caller, if the error is a fault
    pub fn fault(&self) -> Option<&FaultRecord> {
        match self {
            Self::Fault(fault) => Some(fault.record()),
            _ => None,
        }
    }

    /// Extracts the handler's own error, if the handler failed
    ///
    /// # Errors
    ///
    /// Returns `self` unchanged if the error did not come from the handler
    pub fn into_handler_error(self) -> Result<HandlerError, Self> {
        match self {
            Self::Handler(err) => Ok(err),
            other => Err(other),
        }
    }
}

/// Indicates that a host was configured in a way that cannot work
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// No user name validator has been configured
    #[error("no user name validator has been configured")]
    MissingValidator,
    /// An asynchronous validator was configured without installing deferred
    /// authentication, so pending outcomes would never be awaited
    #[error("an asynchronous validator requires deferred authentication to be installed")]
    DeferredAuthenticationNotInstalled,
}

/// An error raised by a host while processing a call
#[derive(Debug, Error)]
pub enum CallError {
    /// The call was rejected during authentication
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    /// The call failed during invocation
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    /// No operation matched the requested name
    #[error("no operation named `{0}`")]
    UnknownOperation(String),
    /// The result passed to `call_end` was not started on the named
    /// operation
    #[error("invocation was not started on operation `{0}`")]
    OperationMismatch(String),
}

impl CallError {
    /// The fault returned to the caller, if the error is a fault
    pub fn fault(&self) -> Option<&FaultRecord> {
        match self {
            Self::Invoke(err) => err.fault(),
            _ => None,
        }
    }
}
