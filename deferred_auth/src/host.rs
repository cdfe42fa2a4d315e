//! Service description, credential configuration, and a minimal dispatcher

use std::{fmt, sync::Arc};

use deferred_auth_traits::{AsyncValidator, SyncValidator};

use crate::{
    authenticator::{CredentialValidator, UserNameAuthenticator},
    context::CallContext,
    error::{CallError, ConfigurationError},
    fault::{FaultTranslator, VerboseFaultTranslator},
    invoker::{
        AsAny, AsyncCallback, AsyncResult, AsyncState, CompletionInvoker, Instance, Invocation,
        InvokeOutput, OperationInvoker, Value,
    },
};

/// Credential configuration for a service
#[derive(Clone, Debug, Default)]
pub struct ServiceCredentials {
    user_name_validator: Option<CredentialValidator>,
    deferred_authentication: bool,
}

impl ServiceCredentials {
    /// Constructs an empty credential configuration
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates user name credentials with a synchronous validator
    pub fn with_sync_validator<V>(self, validator: V) -> Self
    where
        V: SyncValidator + 'static,
    {
        self.with_validator(CredentialValidator::from_sync(validator))
    }

    /// Validates user name credentials with an asynchronous validator
    ///
    /// The service description must also opt into
    /// [`use_async_authentication`](ServiceDescription::use_async_authentication).
    pub fn with_async_validator<V>(self, validator: V) -> Self
    where
        V: AsyncValidator + 'static,
    {
        self.with_validator(CredentialValidator::from_async(validator))
    }

    /// Sets the user name validator
    pub fn with_validator(mut self, validator: CredentialValidator) -> Self {
        self.set_validator(validator);
        self
    }

    /// Sets the user name validator
    pub fn set_validator(&mut self, validator: CredentialValidator) {
        self.user_name_validator = Some(validator);
    }

    /// The configured user name validator
    #[inline]
    pub fn validator(&self) -> Option<&CredentialValidator> {
        self.user_name_validator.as_ref()
    }

    /// Whether deferred authentication has been installed
    #[inline]
    pub fn is_deferred_authentication_installed(&self) -> bool {
        self.deferred_authentication
    }

    /// Builds the authenticator for user name credentials
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingValidator`] if no validator is
    /// configured, or
    /// [`ConfigurationError::DeferredAuthenticationNotInstalled`] if an
    /// asynchronous validator is configured but nothing would wait on its
    /// outcomes.
    pub fn create_user_name_authenticator(
        &self,
    ) -> Result<UserNameAuthenticator, ConfigurationError> {
        let validator = self
            .user_name_validator
            .clone()
            .ok_or(ConfigurationError::MissingValidator)?;

        if validator.is_async() && !self.deferred_authentication {
            return Err(ConfigurationError::DeferredAuthenticationNotInstalled);
        }

        Ok(UserNameAuthenticator::new(validator))
    }
}

/// A named operation and the invoker that runs it
#[derive(Clone, Debug)]
pub struct DispatchOperation {
    name: String,
    invoker: Arc<dyn OperationInvoker>,
}

impl DispatchOperation {
    /// Constructs an operation
    pub fn new<I>(name: impl Into<String>, invoker: I) -> Self
    where
        I: OperationInvoker + 'static,
    {
        Self::from_arc(name, Arc::new(invoker))
    }

    /// Constructs an operation around a shared invoker
    pub fn from_arc(name: impl Into<String>, invoker: Arc<dyn OperationInvoker>) -> Self {
        Self {
            name: name.into(),
            invoker,
        }
    }

    /// The operation name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The operation's invoker
    #[inline]
    pub fn invoker(&self) -> &Arc<dyn OperationInvoker> {
        &self.invoker
    }

    /// Whether the invoker already waits on pending validation outcomes
    pub fn is_intercepted(&self) -> bool {
        AsAny::as_any(self.invoker.as_ref()).is::<CompletionInvoker>()
    }

    fn intercept(&mut self, translator: &Arc<dyn FaultTranslator>) {
        if self.is_intercepted() {
            tracing::trace!(operation = %self.name, "operation already intercepted");
            return;
        }

        self.invoker = Arc::new(
            CompletionInvoker::new(Arc::clone(&self.invoker))
                .with_shared_translator(Arc::clone(translator)),
        );
        tracing::trace!(operation = %self.name, "operation intercepted");
    }
}

/// A group of operations exposed together
#[derive(Clone, Debug)]
pub struct ServiceEndpoint {
    name: String,
    operations: Vec<DispatchOperation>,
}

impl ServiceEndpoint {
    /// Constructs an endpoint without operations
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
        }
    }

    /// Adds an operation
    pub fn with_operation(mut self, operation: DispatchOperation) -> Self {
        self.add_operation(operation);
        self
    }

    /// Adds an operation
    pub fn add_operation(&mut self, operation: DispatchOperation) {
        self.operations.push(operation);
    }

    /// The endpoint name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The endpoint's operations
    #[inline]
    pub fn operations(&self) -> &[DispatchOperation] {
        &self.operations
    }

    /// Finds an operation by name
    pub fn find_operation(&self, name: &str) -> Option<&DispatchOperation> {
        self.operations.iter().find(|op| op.name == name)
    }
}

/// Everything a host needs to serve a service
#[derive(Clone, Debug, Default)]
pub struct ServiceDescription {
    credentials: ServiceCredentials,
    endpoints: Vec<ServiceEndpoint>,
    translator: Option<Arc<dyn FaultTranslator>>,
}

impl ServiceDescription {
    /// Constructs a description without endpoints
    pub fn new(credentials: ServiceCredentials) -> Self {
        Self {
            credentials,
            endpoints: Vec::new(),
            translator: None,
        }
    }

    /// Adds an endpoint
    pub fn with_endpoint(mut self, endpoint: ServiceEndpoint) -> Self {
        self.add_endpoint(endpoint);
        self
    }

    /// Adds an endpoint
    ///
    /// Endpoints added after deferred authentication has been installed are
    /// intercepted too.
    pub fn add_endpoint(&mut self, mut endpoint: ServiceEndpoint) {
        if let Some(translator) = &self.translator {
            for operation in &mut endpoint.operations {
                operation.intercept(translator);
            }
        }
        self.endpoints.push(endpoint);
    }

    /// The credential configuration
    #[inline]
    pub fn credentials(&self) -> &ServiceCredentials {
        &self.credentials
    }

    /// Mutable access to the credential configuration
    #[inline]
    pub fn credentials_mut(&mut self) -> &mut ServiceCredentials {
        &mut self.credentials
    }

    /// The service's endpoints
    #[inline]
    pub fn endpoints(&self) -> &[ServiceEndpoint] {
        &self.endpoints
    }

    /// Finds an operation by name across all endpoints
    pub fn find_operation(&self, name: &str) -> Option<&DispatchOperation> {
        self.endpoints
            .iter()
            .find_map(|endpoint| endpoint.find_operation(name))
    }

    /// Installs deferred authentication, reporting failures with the
    /// [`VerboseFaultTranslator`]
    ///
    /// Every operation's invoker is wrapped so that it waits on the call's
    /// pending validation outcome. Installing more than once has no further
    /// effect.
    pub fn use_async_authentication(&mut self) {
        self.use_async_authentication_with_translator(VerboseFaultTranslator);
    }

    /// Installs deferred authentication with a custom fault translator
    ///
    /// Operations that are already intercepted keep the translator they were
    /// wrapped with.
    pub fn use_async_authentication_with_translator<T>(&mut self, translator: T)
    where
        T: FaultTranslator + 'static,
    {
        let translator: Arc<dyn FaultTranslator> = Arc::new(translator);
        self.credentials.deferred_authentication = true;
        self.translator = Some(Arc::clone(&translator));

        for operation in self
            .endpoints
            .iter_mut()
            .flat_map(|endpoint| endpoint.operations.iter_mut())
        {
            operation.intercept(&translator);
        }

        tracing::debug!(
            endpoints = self.endpoints.len(),
            "deferred authentication installed"
        );
    }
}

/// User name and password supplied with a call
#[derive(Clone)]
pub struct UserNameCredentials {
    username: String,
    password: String,
}

impl UserNameCredentials {
    /// Constructs credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The user name
    #[inline]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password
    #[inline]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for UserNameCredentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UserNameCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Dispatches calls against a service description
///
/// Each call is authenticated, its authorization policies are evaluated
/// into a fresh [`CallContext`], and the named operation is invoked.
#[derive(Clone, Debug)]
pub struct ServiceHost {
    description: Arc<ServiceDescription>,
    authenticator: UserNameAuthenticator,
}

impl ServiceHost {
    /// Opens a host for the description
    ///
    /// # Errors
    ///
    /// Returns an error if the credential configuration cannot authenticate
    /// calls
    pub fn open(description: ServiceDescription) -> Result<Self, ConfigurationError> {
        let authenticator = description.credentials.create_user_name_authenticator()?;

        tracing::debug!(
            endpoints = description.endpoints.len(),
            deferred = description.credentials.deferred_authentication,
            "service host opened"
        );

        Ok(Self {
            description: Arc::new(description),
            authenticator,
        })
    }

    /// The description being served
    #[inline]
    pub fn description(&self) -> &ServiceDescription {
        &self.description
    }

    /// Runs a call to completion on the calling thread
    ///
    /// # Errors
    ///
    /// Returns an error if the operation is unknown, the credentials are
    /// rejected, or the invocation fails
    #[tracing::instrument(
        level = "debug",
        skip(self, credentials, instance, inputs),
        fields(username = %credentials.username())
    )]
    pub fn call(
        &self,
        operation: &str,
        credentials: &UserNameCredentials,
        instance: Instance,
        inputs: Vec<Value>,
    ) -> Result<InvokeOutput, CallError> {
        let (op, invocation) = self.prepare(operation, credentials, instance, inputs)?;
        Ok(op.invoker().invoke(invocation)?)
    }

    /// Starts a call without blocking on validation or the handler
    ///
    /// # Errors
    ///
    /// Returns an error if the operation is unknown or the credentials are
    /// rejected before dispatch. Later failures are reported by
    /// [`call_end`](Self::call_end).
    #[tracing::instrument(
        level = "debug",
        skip(self, credentials, instance, inputs, callback, state),
        fields(username = %credentials.username())
    )]
    pub fn call_begin(
        &self,
        operation: &str,
        credentials: &UserNameCredentials,
        instance: Instance,
        inputs: Vec<Value>,
        callback: Option<AsyncCallback>,
        state: Option<AsyncState>,
    ) -> Result<AsyncResult, CallError> {
        let (op, invocation) = self.prepare(operation, credentials, instance, inputs)?;

        let name: Arc<str> = Arc::from(op.name());
        let callback = callback.map(|callback| -> AsyncCallback {
            let name = Arc::clone(&name);
            Box::new(move |result: &AsyncResult| {
                result.bind_operation(&name);
                callback(result);
            })
        });

        let result = op.invoker().invoke_begin(invocation, callback, state);
        result.bind_operation(&name);
        Ok(result)
    }

    /// Takes the result of a call started with
    /// [`call_begin`](Self::call_begin)
    ///
    /// # Errors
    ///
    /// Returns an error if the operation is unknown, `result` was not started
    /// on it, or the invocation failed
    pub fn call_end(&self, operation: &str, result: &AsyncResult) -> Result<InvokeOutput, CallError> {
        let op = self.operation(operation)?;
        if result.operation() != Some(op.name()) {
            return Err(CallError::OperationMismatch(op.name().to_owned()));
        }

        Ok(op.invoker().invoke_end(result)?)
    }

    fn operation(&self, name: &str) -> Result<&DispatchOperation, CallError> {
        self.description
            .find_operation(name)
            .ok_or_else(|| CallError::UnknownOperation(name.to_owned()))
    }

    fn prepare(
        &self,
        operation: &str,
        credentials: &UserNameCredentials,
        instance: Instance,
        inputs: Vec<Value>,
    ) -> Result<(&DispatchOperation, Invocation), CallError> {
        let op = self.operation(operation)?;
        let policies = self
            .authenticator
            .authenticate(credentials.username(), credentials.password())?;

        let mut call = CallContext::for_user(credentials.username());
        call.authorize(&policies);

        Ok((op, Invocation::new(call, instance, inputs)))
    }
}
