//! Deferred credential validation for synchronous and begin/end dispatch
//!
//! A dispatcher that only understands blocking or begin/end invocations can
//! still authenticate callers against a validator that answers later. The
//! pieces fit together like this:
//!
//! 1. The [`UserNameAuthenticator`] calls the configured validator. If the
//!    verdict is already known, the call is accepted or rejected on the
//!    spot. Otherwise the pending [`ValidationOutcome`] is wrapped in a
//!    [`PendingOutcomeCarrier`] and returned with the call's authorization
//!    policies.
//! 2. Evaluating the policies deposits the outcome into the call's
//!    [`CallContext`] under [`PENDING_AUTHORIZATION_TASK`].
//! 3. The [`CompletionInvoker`] wrapped around every operation takes the
//!    outcome back out and waits on it before running the handler. A failed
//!    outcome becomes a [`FaultRecord`] and the handler never runs.
//!
//! [`ServiceDescription::use_async_authentication`] installs the wrapping.
//!
//! ```
//! use std::{sync::Arc, thread, time::Duration};
//!
//! use deferred_auth::{
//!     AsyncValidator, DispatchOperation, Instance, InvokeOutput, MethodInvoker,
//!     ServiceCredentials, ServiceDescription, ServiceEndpoint, ServiceHost,
//!     UserNameCredentials, ValidationError, ValidationOutcome,
//! };
//!
//! struct Directory;
//!
//! impl AsyncValidator for Directory {
//!     fn validate(&self, username: &str, password: &str) -> ValidationOutcome {
//!         let (settler, outcome) = ValidationOutcome::channel();
//!         let accepted = password == "hunter2";
//!         let username = username.to_owned();
//!         thread::spawn(move || {
//!             thread::sleep(Duration::from_millis(50));
//!             if accepted {
//!                 settler.succeed();
//!             } else {
//!                 settler.fail(ValidationError::new(format!("unknown user {username}")));
//!             }
//!         });
//!         outcome
//!     }
//! }
//!
//! let greet = MethodInvoker::new("greet", |invocation| {
//!     let user = invocation.call.username().unwrap_or("anonymous");
//!     Ok(InvokeOutput::new(format!("hello, {user}").into()))
//! });
//!
//! let mut description =
//!     ServiceDescription::new(ServiceCredentials::new().with_async_validator(Directory))
//!         .with_endpoint(
//!             ServiceEndpoint::new("greeter")
//!                 .with_operation(DispatchOperation::new("Greet", greet)),
//!         );
//! description.use_async_authentication();
//!
//! let host = ServiceHost::open(description)?;
//! let instance: Instance = Arc::new(());
//!
//! let ada = UserNameCredentials::new("ada", "hunter2");
//! let output = host.call("Greet", &ada, instance.clone(), Vec::new())?;
//! assert_eq!(output.result, "hello, ada");
//!
//! let mallory = UserNameCredentials::new("mallory", "guess");
//! let err = host.call("Greet", &mallory, instance, Vec::new()).unwrap_err();
//! let fault = err.fault().unwrap();
//! assert!(fault.is_invalid_security_token());
//! assert!(fault.reason().ends_with("unknown user mallory"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Feature flags
//!
//! The `tokio` feature, enabled by default, re-exports [`Spawned`], which
//! runs an `async` [`CredentialCheck`] on the tokio runtime.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod authenticator;
mod carrier;
mod context;
mod error;
pub mod fault;
mod host;
mod invoker;

pub use authenticator::{CredentialValidator, UserNameAuthenticator};
pub use carrier::PendingOutcomeCarrier;
pub use context::{
    AuthorizationPolicies, AuthorizationPolicy, CallContext, Claim, EvaluationContext,
    Properties, PropertyTypeMismatch, UserNamePolicy, NAME_CLAIM_TYPE,
    PENDING_AUTHORIZATION_TASK,
};
#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
pub use deferred_auth_traits::Spawned;
pub use deferred_auth_traits::{
    AsyncValidator, CredentialCheck, OutcomeSettler, SyncValidator, ValidationError,
    ValidationOutcome,
};
pub use error::{
    AuthenticationError, BridgeError, CallError, ConfigurationError, HandlerError, InvokeError,
};
pub use fault::{FaultError, FaultRecord, FaultTranslator, TerseFaultTranslator, VerboseFaultTranslator};
pub use host::{
    DispatchOperation, ServiceCredentials, ServiceDescription, ServiceEndpoint, ServiceHost,
    UserNameCredentials,
};
pub use invoker::{
    AsAny, AsyncCallback, AsyncResult, AsyncState, Completer, CompletionInvoker, Instance,
    Invocation, InvokeOutput, MethodInvoker, OperationInvoker, Value,
};
