use std::{error::Error, fmt, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use deferred_auth::{
    AuthenticationError, CallContext, Claim, FaultRecord, FaultTranslator, UserNameAuthenticator,
    ValidationOutcome, VerboseFaultTranslator,
};
use http::{Request, Response};
use http_body::Body;
use tower_http::validate_request::{ValidateRequest, ValidateRequestHeaderLayer};
use tower_layer::Stack;

use crate::{
    util::{internal_server_error, unauthorized},
    AwaitAuthorizationLayer, TerseErrorHandler, VerboseErrorHandler,
};

/// The authenticated caller, available through
/// [`Request::extensions`][http::Request::extensions]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    username: String,
    claims: Vec<Claim>,
}

impl Principal {
    /// The authenticated user name
    #[inline]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Claims asserted while authorizing the request
    #[inline]
    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }
}

/// A validation outcome that had not settled when the request was
/// authenticated
///
/// [`AwaitAuthorization`](crate::AwaitAuthorization) removes this from the
/// request extensions and waits on it before calling the inner service.
#[derive(Clone, Debug)]
pub struct PendingAuthorization(ValidationOutcome);

impl PendingAuthorization {
    /// Wraps a pending outcome
    #[inline]
    pub fn new(outcome: ValidationOutcome) -> Self {
        Self(outcome)
    }

    /// The pending outcome
    #[inline]
    pub fn outcome(&self) -> &ValidationOutcome {
        &self.0
    }

    /// Extracts the pending outcome
    #[inline]
    pub fn into_outcome(self) -> ValidationOutcome {
        self.0
    }
}

/// The stack built by [`BasicAuthenticator::layer`]
///
/// Requests pass through [`ValidateBasic`] first and then wait in
/// [`AwaitAuthorization`](crate::AwaitAuthorization) for any pending verdict.
pub type BasicAuthLayer<OnError> =
    Stack<AwaitAuthorizationLayer<OnError>, ValidateRequestHeaderLayer<ValidateBasic<OnError>>>;

/// Authenticates requests carrying `Authorization: Basic` credentials
///
/// Credentials rejected before the validator returns are answered
/// immediately. A verdict still pending is awaited before the inner service
/// is called, and a rejection is answered with the translated fault.
#[derive(Clone)]
pub struct BasicAuthenticator<OnError> {
    authenticator: UserNameAuthenticator,
    on_error: OnError,
    translator: Arc<dyn FaultTranslator>,
}

impl<OnError> fmt::Debug for BasicAuthenticator<OnError>
where
    OnError: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BasicAuthenticator")
            .field("authenticator", &self.authenticator)
            .field("on_error", &self.on_error)
            .field("translator", &self.translator)
            .finish()
    }
}

impl BasicAuthenticator<()> {
    /// Constructs an authenticator without an error handler
    ///
    /// Deferred rejections are reported with the [`VerboseFaultTranslator`].
    #[inline]
    pub fn new(authenticator: UserNameAuthenticator) -> Self {
        Self {
            authenticator,
            on_error: (),
            translator: Arc::new(VerboseFaultTranslator),
        }
    }

    /// Attaches a custom error handler to generate responses
    /// in the event of an authentication failure
    #[inline]
    pub fn with_error_handler<OnError>(self, on_error: OnError) -> BasicAuthenticator<OnError> {
        BasicAuthenticator {
            authenticator: self.authenticator,
            on_error,
            translator: self.translator,
        }
    }

    /// Attaches the default terse error handler: [`TerseErrorHandler`]
    ///
    /// This error handler generates responses containing the relevant
    /// status code with an empty body
    #[inline]
    pub fn with_terse_error_handler<ResBody: Body + Default>(
        self,
    ) -> BasicAuthenticator<TerseErrorHandler<ResBody>> {
        self.with_error_handler(TerseErrorHandler::new())
    }

    /// Attaches the default verbose error handler: [`VerboseErrorHandler`]
    ///
    /// This error handler generates responses containing the relevant
    /// status code and a description of the failure in the
    /// `www-authenticate` header
    #[inline]
    pub fn with_verbose_error_handler<ResBody: Body + Default>(
        self,
    ) -> BasicAuthenticator<VerboseErrorHandler<ResBody>> {
        self.with_error_handler(VerboseErrorHandler::new())
    }
}

impl<OnError> BasicAuthenticator<OnError> {
    /// Replaces the translator used to build faults for deferred rejections
    pub fn with_fault_translator<T>(self, translator: T) -> Self
    where
        T: FaultTranslator + 'static,
    {
        Self {
            translator: Arc::new(translator),
            ..self
        }
    }
}

impl<OnError> BasicAuthenticator<OnError>
where
    OnError: OnAuthError + Clone,
    OnError::Body: Body + Default,
{
    /// Layer that authenticates each request and waits for any pending
    /// validation before calling the inner service
    pub fn layer(&self) -> BasicAuthLayer<OnError> {
        Stack::new(
            AwaitAuthorizationLayer::new(self.on_error.clone(), Arc::clone(&self.translator)),
            ValidateRequestHeaderLayer::custom(ValidateBasic {
                authenticator: self.authenticator.clone(),
                on_error: self.on_error.clone(),
            }),
        )
    }
}

/// Extracts and authenticates the `Authorization` header of a request
///
/// Built only by [`BasicAuthenticator::layer`], which always pairs it with
/// the layer that awaits pending validation.
#[derive(Clone)]
pub struct ValidateBasic<OnError> {
    authenticator: UserNameAuthenticator,
    on_error: OnError,
}

impl<OnError> fmt::Debug for ValidateBasic<OnError>
where
    OnError: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ValidateBasic")
            .field("authenticator", &self.authenticator)
            .field("on_error", &self.on_error)
            .finish()
    }
}

impl<OnError, ReqBody> ValidateRequest<ReqBody> for ValidateBasic<OnError>
where
    OnError: OnAuthError,
    OnError::Body: Body + Default,
{
    type ResponseBody = OnError::Body;

    fn validate(
        &mut self,
        request: &mut Request<ReqBody>,
    ) -> Result<(), Response<Self::ResponseBody>> {
        tracing::trace!("extracting basic credentials from headers");
        let (username, password) = request
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_basic)
            .ok_or_else(|| self.on_error.on_missing_or_malformed())?;

        let policies = self
            .authenticator
            .authenticate(&username, &password)
            .map_err(|err| self.on_error.on_rejected(err))?;

        let mut call = CallContext::for_user(username);
        call.authorize(&policies);

        let pending = call.take_pending_outcome().map_err(|err| {
            let error: &(dyn Error + 'static) = &err;
            tracing::error!(error, "unable to read pending validation");
            internal_server_error()
        })?;

        if let Some(outcome) = pending {
            tracing::trace!("validation pending");
            let _ = request
                .extensions_mut()
                .insert(PendingAuthorization::new(outcome));
        }

        let _ = request.extensions_mut().insert(Principal {
            username: call.username().unwrap_or_default().to_owned(),
            claims: call.claims().to_vec(),
        });

        Ok(())
    }
}

/// Handler for responding to authentication failures
pub trait OnAuthError {
    /// The body type returned on an error
    type Body;

    /// Response when the credentials were not found or were otherwise
    /// malformed
    fn on_missing_or_malformed(&self) -> Response<Self::Body>;

    /// Response when the credentials were rejected before the validator
    /// returned
    fn on_rejected(&self, error: AuthenticationError) -> Response<Self::Body>;

    /// Response when the credentials were rejected while the request was
    /// waiting on validation
    fn on_fault(&self, fault: FaultRecord) -> Response<Self::Body>;
}

macro_rules! delegate_impls {
    ($($ty:ty)*) => {
        $(
            impl<T> OnAuthError for $ty
            where
                T: OnAuthError,
            {
                type Body = T::Body;

                fn on_missing_or_malformed(&self) -> Response<Self::Body> {
                    T::on_missing_or_malformed(self)
                }

                fn on_rejected(&self, error: AuthenticationError) -> Response<Self::Body> {
                    T::on_rejected(self, error)
                }

                fn on_fault(&self, fault: FaultRecord) -> Response<Self::Body> {
                    T::on_fault(self, fault)
                }
            }
        )*
    }
}

delegate_impls!(
    &'_ T
    Box<T>
    std::rc::Rc<T>
    std::sync::Arc<T>
);

impl<ResBody> OnAuthError for TerseErrorHandler<ResBody>
where
    ResBody: Default,
{
    type Body = ResBody;

    #[inline]
    fn on_missing_or_malformed(&self) -> Response<Self::Body> {
        tracing::debug!("authentication failed: credentials are missing or malformed");
        unauthorized("")
    }

    #[inline]
    fn on_rejected(&self, _: AuthenticationError) -> Response<Self::Body> {
        tracing::debug!("authentication failed");
        unauthorized("")
    }

    #[inline]
    fn on_fault(&self, _: FaultRecord) -> Response<Self::Body> {
        tracing::debug!("authentication failed after validation completed");
        unauthorized("")
    }
}

impl<ResBody> OnAuthError for VerboseErrorHandler<ResBody>
where
    ResBody: Default,
{
    type Body = ResBody;

    #[inline]
    fn on_missing_or_malformed(&self) -> Response<Self::Body> {
        let message = "credentials are missing or malformed";
        tracing::debug!("authentication failed: {message}");
        unauthorized(message)
    }

    #[inline]
    fn on_rejected(&self, error: AuthenticationError) -> Response<Self::Body> {
        let description = error.to_string();
        tracing::debug!("authentication failed: {description}");
        unauthorized(&description)
    }

    #[inline]
    fn on_fault(&self, fault: FaultRecord) -> Response<Self::Body> {
        tracing::debug!("authentication failed: {}", fault.reason());
        unauthorized(fault.reason())
    }
}

fn extract_basic(auth: &str) -> Option<(String, String)> {
    let scheme = auth.get(..6)?;
    if auth.len() <= 6 || !scheme.eq_ignore_ascii_case("basic ") {
        return None;
    }

    let decoded = STANDARD.decode(auth[6..].trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;

    Some((username.to_owned(), password.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_basic_credentials() {
        let header = format!("Basic {}", STANDARD.encode("01:test"));
        assert_eq!(
            extract_basic(&header),
            Some(("01".to_owned(), "test".to_owned()))
        );
    }

    #[test]
    fn scheme_is_case_insensitive_and_password_may_contain_colons() {
        let header = format!("bAsIc {}", STANDARD.encode("01:a:b"));
        assert_eq!(
            extract_basic(&header),
            Some(("01".to_owned(), "a:b".to_owned()))
        );
    }

    #[test]
    fn rejects_other_schemes_and_bad_encodings() {
        assert_eq!(extract_basic("Bearer abc.def.ghi"), None);
        assert_eq!(extract_basic("Basic "), None);
        assert_eq!(extract_basic("Basic !!!"), None);
        assert_eq!(extract_basic(&format!("Basic {}", STANDARD.encode("nocolon"))), None);
        assert_eq!(extract_basic("Ba"), None);
    }
}
