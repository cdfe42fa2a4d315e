//! Tower middleware for deferred credential validation
//!
//! [`BasicAuthenticator::layer`] authenticates `Authorization: Basic`
//! credentials without blocking on a slow validator. It stacks two steps:
//!
//! * [`ValidateBasic`] runs the
//!   [`UserNameAuthenticator`](deferred_auth::UserNameAuthenticator). Calls
//!   rejected on the spot are answered immediately. A verdict still pending
//!   is attached to the request as [`PendingAuthorization`].
//! * [`AwaitAuthorization`] waits on that verdict and only then calls the
//!   inner service. A rejection is answered with the translated fault.
//!
//! The authenticated caller is available to the inner service as a
//! [`Principal`] in [`Request::extensions`][http::Request::extensions].
//!
//! ```
//! use std::convert::Infallible;
//!
//! use deferred_auth::{
//!     CredentialCheck, CredentialValidator, Spawned, UserNameAuthenticator, ValidationError,
//! };
//! use deferred_auth_tower::{BasicAuthenticator, Principal};
//! use http::{Request, Response};
//! use tower_layer::Layer;
//!
//! struct Directory;
//!
//! #[async_trait::async_trait]
//! impl CredentialCheck for Directory {
//!     async fn check(&self, username: &str, password: &str) -> Result<(), ValidationError> {
//!         // A directory lookup would go here
//!         if password == "hunter2" {
//!             Ok(())
//!         } else {
//!             Err(ValidationError::new(format!("unknown user {username}")))
//!         }
//!     }
//! }
//!
//! let authenticator =
//!     UserNameAuthenticator::new(CredentialValidator::from_async(Spawned::new(Directory)));
//! let basic = BasicAuthenticator::new(authenticator).with_verbose_error_handler::<String>();
//!
//! let handler = tower::service_fn(|request: Request<String>| async move {
//!     let user = request.extensions().get::<Principal>().map(|p| p.username().to_owned());
//!     Ok::<_, Infallible>(Response::new(format!("hello, {}", user.unwrap_or_default())))
//! });
//!
//! let service = basic.layer().layer(handler);
//! # drop(service);
//! ```

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

use std::{fmt, marker::PhantomData};

mod await_auth;
mod basic;
pub mod util;

pub use crate::await_auth::*;
pub use crate::basic::*;

/// Terse responders for authentication failures
///
/// Responses carry the relevant status code and a `www-authenticate`
/// challenge without any description of the failure.
pub struct TerseErrorHandler<ResBody> {
    _ty: PhantomData<fn() -> ResBody>,
}

impl<ResBody> TerseErrorHandler<ResBody> {
    /// Instantiates a new instance over a given body type
    #[inline]
    pub fn new() -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> fmt::Debug for TerseErrorHandler<ResBody> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("TerseErrorHandler")
    }
}

impl<ResBody> Default for TerseErrorHandler<ResBody> {
    #[inline]
    fn default() -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> Clone for TerseErrorHandler<ResBody> {
    #[inline]
    fn clone(&self) -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> Copy for TerseErrorHandler<ResBody> {}

/// Verbose responders for authentication failures
///
/// Responses describe the failure in the `error_description` of the
/// `www-authenticate` challenge. Deferred failures are described by the
/// reason of the translated fault.
pub struct VerboseErrorHandler<ResBody> {
    _ty: PhantomData<fn() -> ResBody>,
}

impl<ResBody> VerboseErrorHandler<ResBody> {
    /// Instantiates a new instance over a given body type
    #[inline]
    pub fn new() -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> fmt::Debug for VerboseErrorHandler<ResBody> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("VerboseErrorHandler")
    }
}

impl<ResBody> Default for VerboseErrorHandler<ResBody> {
    #[inline]
    fn default() -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> Clone for VerboseErrorHandler<ResBody> {
    #[inline]
    fn clone(&self) -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> Copy for VerboseErrorHandler<ResBody> {}
