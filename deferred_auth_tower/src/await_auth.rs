use std::{
    error::Error,
    fmt,
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use deferred_auth::FaultTranslator;
use http::{Request, Response};
use tower_layer::Layer;
use tower_service::Service;

use crate::{OnAuthError, PendingAuthorization};

/// Layer that holds requests back until their pending validation settles
///
/// Requests rejected while waiting are answered by the error handler with
/// the fault built by the configured [`FaultTranslator`]. Requests without
/// [`PendingAuthorization`] pass straight through.
///
/// Built as part of [`BasicAuthenticator::layer`](crate::BasicAuthenticator::layer).
#[derive(Clone)]
pub struct AwaitAuthorizationLayer<OnError> {
    on_error: OnError,
    translator: Arc<dyn FaultTranslator>,
}

impl<OnError> AwaitAuthorizationLayer<OnError> {
    pub(crate) fn new(on_error: OnError, translator: Arc<dyn FaultTranslator>) -> Self {
        Self {
            on_error,
            translator,
        }
    }
}

impl<OnError> fmt::Debug for AwaitAuthorizationLayer<OnError>
where
    OnError: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AwaitAuthorizationLayer")
            .field("on_error", &self.on_error)
            .field("translator", &self.translator)
            .finish()
    }
}

impl<S, OnError> Layer<S> for AwaitAuthorizationLayer<OnError>
where
    OnError: Clone,
{
    type Service = AwaitAuthorization<S, OnError>;

    fn layer(&self, inner: S) -> Self::Service {
        AwaitAuthorization {
            inner,
            on_error: self.on_error.clone(),
            translator: Arc::clone(&self.translator),
        }
    }
}

/// Service that waits on a request's [`PendingAuthorization`] before
/// calling the inner service
#[derive(Clone)]
pub struct AwaitAuthorization<S, OnError> {
    inner: S,
    on_error: OnError,
    translator: Arc<dyn FaultTranslator>,
}

impl<S, OnError> fmt::Debug for AwaitAuthorization<S, OnError>
where
    S: fmt::Debug,
    OnError: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AwaitAuthorization")
            .field("inner", &self.inner)
            .field("on_error", &self.on_error)
            .field("translator", &self.translator)
            .finish()
    }
}

impl<S, OnError, ReqBody> Service<Request<ReqBody>> for AwaitAuthorization<S, OnError>
where
    S: Service<Request<ReqBody>, Response = Response<OnError::Body>> + Clone + Send + 'static,
    S::Future: Send,
    OnError: OnAuthError + Clone + Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let pending = request.extensions_mut().remove::<PendingAuthorization>();
        let on_error = self.on_error.clone();
        let translator = Arc::clone(&self.translator);

        let not_ready_inner = self.inner.clone();
        let mut ready_inner = mem::replace(&mut self.inner, not_ready_inner);

        Box::pin(async move {
            if let Some(pending) = pending {
                tracing::trace!("awaiting pending validation");
                if let Err(err) = pending.into_outcome().await {
                    let fault = {
                        let error: &(dyn Error + 'static) = &err;
                        tracing::debug!(error, "deferred validation failed");
                        translator.translate(error)
                    };
                    return Ok(on_error.on_fault(fault));
                }
                tracing::trace!("pending validation succeeded");
            }

            ready_inner.call(request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use color_eyre::Result;
    use deferred_auth::{
        CredentialCheck, CredentialValidator, Spawned, TerseFaultTranslator,
        UserNameAuthenticator, ValidationError, VerboseFaultTranslator,
    };
    use http::{header, StatusCode};
    use tower::ServiceExt;
    use tracing_test::traced_test;

    use crate::{BasicAuthenticator, Principal, TerseErrorHandler};

    use super::*;

    struct Directory {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl CredentialCheck for Directory {
        async fn check(&self, username: &str, password: &str) -> Result<(), ValidationError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            if password == "test" {
                Ok(())
            } else {
                Err(ValidationError::new(format!(
                    "Oops, bad robot with userName {username}"
                )))
            }
        }
    }

    fn authenticator(delay: Duration) -> UserNameAuthenticator {
        UserNameAuthenticator::new(CredentialValidator::from_async(Spawned::new(Directory {
            delay,
        })))
    }

    fn request(credentials: Option<&str>) -> Request<String> {
        let mut builder = Request::builder().uri("/robots");
        if let Some(credentials) = credentials {
            use base64::{engine::general_purpose::STANDARD, Engine as _};
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Basic {}", STANDARD.encode(credentials)),
            );
        }
        builder.body(String::new()).unwrap()
    }

    fn echo(
        counter: Arc<AtomicUsize>,
    ) -> impl Service<
        Request<String>,
        Response = Response<String>,
        Error = Infallible,
        Future = impl Send,
    > + Clone
           + Send
           + 'static {
        tower::service_fn(move |request: Request<String>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let user = request
                    .extensions()
                    .get::<Principal>()
                    .map(|principal| principal.username().to_owned())
                    .unwrap_or_default();
                Ok::<_, Infallible>(Response::new(format!("hello, {user}")))
            }
        })
    }

    fn www_authenticate(response: &Response<String>) -> &str {
        response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn deferred_success_reaches_the_inner_service_once() -> Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let basic = BasicAuthenticator::new(authenticator(Duration::from_millis(10)))
            .with_verbose_error_handler::<String>();
        let service = basic.layer().layer(echo(counter.clone()));

        let response = service.oneshot(request(Some("01:test"))).await?;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "hello, 01");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn deferred_rejection_is_answered_with_the_fault() -> Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let basic = BasicAuthenticator::new(authenticator(Duration::from_millis(10)))
            .with_verbose_error_handler::<String>();
        let service = basic.layer().layer(echo(counter.clone()));

        let response = service.oneshot(request(Some("01:nope"))).await?;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = www_authenticate(&response);
        assert!(challenge.contains("An error occurred when processing the security tokens"));
        assert!(challenge.contains("Oops, bad robot with userName 01"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn immediate_rejection_is_answered_before_waiting() -> Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let basic = BasicAuthenticator::new(authenticator(Duration::ZERO))
            .with_verbose_error_handler::<String>();
        let service = basic.layer().layer(echo(counter.clone()));

        let response = service.oneshot(request(Some("01:nope"))).await?;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            www_authenticate(&response),
            r#"Basic error="invalid_credentials" error_description="Oops, bad robot with userName 01""#
        );
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected_tersely() -> Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let basic = BasicAuthenticator::new(authenticator(Duration::ZERO))
            .with_terse_error_handler::<String>();
        let service = basic.layer().layer(echo(counter.clone()));

        let response = service.oneshot(request(None)).await?;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            www_authenticate(&response),
            r#"Basic error="invalid_credentials""#
        );
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn slow_rejection_is_held_back_from_the_handler() -> Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let basic = BasicAuthenticator::new(authenticator(Duration::from_millis(50)))
            .with_terse_error_handler::<String>();
        let service = basic.layer().layer(echo(counter.clone()));

        let response = service.oneshot(request(Some("01:nope"))).await?;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_ne!(response.body(), "hello, 01");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn requests_without_pending_validation_pass_through() -> Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let service = AwaitAuthorizationLayer::new(
            TerseErrorHandler::<String>::new(),
            Arc::new(VerboseFaultTranslator),
        )
        .layer(echo(counter.clone()));

        let response = service.oneshot(request(None)).await?;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn terse_translator_withholds_the_reason() -> Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let basic = BasicAuthenticator::new(authenticator(Duration::from_millis(10)))
            .with_verbose_error_handler::<String>()
            .with_fault_translator(TerseFaultTranslator);
        let service = basic.layer().layer(echo(counter.clone()));

        let response = service.oneshot(request(Some("01:nope"))).await?;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!www_authenticate(&response).contains("bad robot"));
        assert!(logs_contain("deferred validation failed"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
