//! Operation invokers and the interceptor that holds them back until a
//! pending validation outcome settles

use std::{
    any::Any,
    error, fmt, mem,
    sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError},
};

use deferred_auth_traits::ValidationError;

use crate::{
    context::CallContext,
    error::{BridgeError, HandlerError, InvokeError},
    fault::{FaultError, FaultTranslator, VerboseFaultTranslator},
};

/// The service instance an operation is invoked on
pub type Instance = Arc<dyn Any + Send + Sync>;

/// An operation input, output, or return value
pub type Value = serde_json::Value;

/// Callback invoked exactly once when a begun invocation completes
pub type AsyncCallback = Box<dyn FnOnce(&AsyncResult) + Send + 'static>;

/// Caller-supplied state carried alongside a begun invocation
pub type AsyncState = Arc<dyn Any + Send + Sync>;

/// Everything an invoker needs to run one call
///
/// The bundle is moved through the invocation, so every piece of per-call
/// state travels explicitly with the call it belongs to.
#[derive(Debug)]
pub struct Invocation {
    /// The call's context
    pub call: CallContext,
    /// The service instance
    pub instance: Instance,
    /// The operation's inputs
    pub inputs: Vec<Value>,
}

impl Invocation {
    /// Bundles a call
    pub fn new(call: CallContext, instance: Instance, inputs: Vec<Value>) -> Self {
        Self {
            call,
            instance,
            inputs,
        }
    }
}

/// What an operation produced
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvokeOutput {
    /// The return value
    pub result: Value,
    /// Values of out parameters
    pub outputs: Vec<Value>,
}

impl InvokeOutput {
    /// An output with only a return value
    pub fn new(result: Value) -> Self {
        Self {
            result,
            outputs: Vec::new(),
        }
    }

    /// Sets the out parameters
    pub fn with_outputs(self, outputs: Vec<Value>) -> Self {
        Self { outputs, ..self }
    }
}

enum Slot {
    Running,
    Completed(Result<InvokeOutput, InvokeError>),
    Ended,
}

struct Progress {
    slot: Slot,
    begin_returned: bool,
    completed_synchronously: bool,
}

struct Completion {
    progress: Mutex<Progress>,
    done: Condvar,
    state: Option<AsyncState>,
    operation: OnceLock<Arc<str>>,
}

impl Completion {
    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracks an invocation started with [`OperationInvoker::invoke_begin`]
///
/// The result completes exactly once. Its callback, if any, is invoked
/// exactly once, after the result becomes available to
/// [`end`](Self::end).
#[derive(Clone)]
pub struct AsyncResult {
    completion: Arc<Completion>,
}

impl AsyncResult {
    /// Starts an invocation
    ///
    /// `start` receives the [`Completer`] for the new result and may complete
    /// it immediately or hand it off to be completed later. A result
    /// completed before `begin` returns reports
    /// [`completed_synchronously`](Self::completed_synchronously).
    pub fn begin<F>(callback: Option<AsyncCallback>, state: Option<AsyncState>, start: F) -> Self
    where
        F: FnOnce(Completer),
    {
        let result = Self {
            completion: Arc::new(Completion {
                progress: Mutex::new(Progress {
                    slot: Slot::Running,
                    begin_returned: false,
                    completed_synchronously: false,
                }),
                done: Condvar::new(),
                state,
                operation: OnceLock::new(),
            }),
        };

        start(Completer {
            result: Some(result.clone()),
            callback,
        });

        result.completion.lock().begin_returned = true;
        result
    }

    /// A result that completed synchronously
    pub fn completed(
        outcome: Result<InvokeOutput, InvokeError>,
        callback: Option<AsyncCallback>,
        state: Option<AsyncState>,
    ) -> Self {
        Self::begin(callback, state, |completer| completer.complete(outcome))
    }

    /// Whether the invocation has completed
    pub fn is_completed(&self) -> bool {
        !matches!(self.completion.lock().slot, Slot::Running)
    }

    /// Whether the invocation completed before `begin` returned
    pub fn completed_synchronously(&self) -> bool {
        self.completion.lock().completed_synchronously
    }

    /// The state supplied when the invocation began
    #[inline]
    pub fn async_state(&self) -> Option<&AsyncState> {
        self.completion.state.as_ref()
    }

    /// The operation a host started this invocation on
    pub fn operation(&self) -> Option<&str> {
        self.completion.operation.get().map(|name| &**name)
    }

    // First binding wins; later calls are no-ops.
    pub(crate) fn bind_operation(&self, name: &str) {
        let _ = self.completion.operation.set(Arc::from(name));
    }

    /// Blocks the calling thread until the invocation completes
    pub fn wait(&self) {
        let mut guard = self.completion.lock();
        while matches!(guard.slot, Slot::Running) {
            guard = self
                .completion
                .done
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Takes the invocation's result
    ///
    /// # Errors
    ///
    /// Returns the invocation's own error, or a [`BridgeError`] if the
    /// invocation has not completed yet or its result was already taken.
    pub fn end(&self) -> Result<InvokeOutput, InvokeError> {
        let mut guard = self.completion.lock();
        match mem::replace(&mut guard.slot, Slot::Ended) {
            Slot::Completed(outcome) => outcome,
            Slot::Running => {
                guard.slot = Slot::Running;
                Err(BridgeError::EndBeforeCompletion.into())
            }
            Slot::Ended => Err(BridgeError::AlreadyEnded.into()),
        }
    }

    /// Whether two handles track the same invocation
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.completion, &other.completion)
    }
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let guard = self.completion.lock();
        let status = match guard.slot {
            Slot::Running => "running",
            Slot::Completed(Ok(_)) => "succeeded",
            Slot::Completed(Err(_)) => "failed",
            Slot::Ended => "ended",
        };

        f.debug_struct("AsyncResult")
            .field("status", &status)
            .field("completed_synchronously", &guard.completed_synchronously)
            .finish()
    }
}

/// The single handle able to complete an [`AsyncResult`]
///
/// Dropping a completer without completing it completes the result with
/// [`BridgeError::Abandoned`], so the callback still fires.
pub struct Completer {
    result: Option<AsyncResult>,
    callback: Option<AsyncCallback>,
}

impl Completer {
    /// Completes the invocation and invokes its callback
    pub fn complete(mut self, outcome: Result<InvokeOutput, InvokeError>) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Result<InvokeOutput, InvokeError>) {
        let Some(result) = self.result.take() else {
            return;
        };

        {
            let mut guard = result.completion.lock();
            guard.completed_synchronously = !guard.begin_returned;
            guard.slot = Slot::Completed(outcome);
        }
        result.completion.done.notify_all();

        if let Some(callback) = self.callback.take() {
            callback(&result);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if self.result.is_some() {
            tracing::warn!("invocation dropped without completing");
            self.finish(Err(BridgeError::Abandoned.into()));
        }
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Completer")
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Access to a value as [`Any`], for type checks on trait objects
pub trait AsAny: Any {
    /// Views the value as [`Any`]
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Runs an operation, either blocking or in the begin/end shape
pub trait OperationInvoker: AsAny + Send + Sync + fmt::Debug {
    /// Allocates the inputs expected by the operation
    fn allocate_inputs(&self) -> Vec<Value> {
        Vec::new()
    }

    /// Runs the operation on the calling thread
    ///
    /// # Errors
    ///
    /// Returns the reason the operation did not produce an output
    fn invoke(&self, invocation: Invocation) -> Result<InvokeOutput, InvokeError>;

    /// Starts the operation without blocking
    fn invoke_begin(
        &self,
        invocation: Invocation,
        callback: Option<AsyncCallback>,
        state: Option<AsyncState>,
    ) -> AsyncResult;

    /// Takes the result of an operation started by
    /// [`invoke_begin`](Self::invoke_begin)
    ///
    /// # Errors
    ///
    /// Returns the reason the operation did not produce an output
    fn invoke_end(&self, result: &AsyncResult) -> Result<InvokeOutput, InvokeError> {
        result.end()
    }

    /// Whether the host should prefer [`invoke`](Self::invoke)
    fn is_synchronous(&self) -> bool;
}

type Handler = dyn Fn(Invocation) -> Result<InvokeOutput, HandlerError> + Send + Sync;

/// Adapts a synchronous handler function into an [`OperationInvoker`]
///
/// Handler errors pass through as [`InvokeError::Handler`] untouched.
#[derive(Clone)]
pub struct MethodInvoker {
    name: Arc<str>,
    input_count: usize,
    handler: Arc<Handler>,
}

impl MethodInvoker {
    /// Wraps a handler
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Invocation) -> Result<InvokeOutput, HandlerError> + Send + Sync + 'static,
    {
        Self {
            name: name.into().into(),
            input_count: 0,
            handler: Arc::new(handler),
        }
    }

    /// Sets the number of inputs the handler expects
    pub fn with_input_count(self, input_count: usize) -> Self {
        Self {
            input_count,
            ..self
        }
    }

    /// The name of the handler
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for MethodInvoker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MethodInvoker")
            .field("name", &self.name)
            .field("input_count", &self.input_count)
            .finish()
    }
}

impl OperationInvoker for MethodInvoker {
    fn allocate_inputs(&self) -> Vec<Value> {
        vec![Value::Null; self.input_count]
    }

    fn invoke(&self, invocation: Invocation) -> Result<InvokeOutput, InvokeError> {
        (self.handler)(invocation).map_err(InvokeError::Handler)
    }

    fn invoke_begin(
        &self,
        invocation: Invocation,
        callback: Option<AsyncCallback>,
        state: Option<AsyncState>,
    ) -> AsyncResult {
        AsyncResult::completed(self.invoke(invocation), callback, state)
    }

    fn is_synchronous(&self) -> bool {
        true
    }
}

/// The lifecycle of an invocation begun through a [`CompletionInvoker`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum InvocationStage {
    Created,
    AwaitingAuth,
    AwaitingHandler,
    Completed,
    Faulted,
}

impl InvocationStage {
    fn can_advance_to(self, next: Self) -> bool {
        use InvocationStage::*;

        matches!(
            (self, next),
            (Created, AwaitingAuth)
                | (Created, AwaitingHandler)
                | (Created, Faulted)
                | (AwaitingAuth, AwaitingHandler)
                | (AwaitingAuth, Faulted)
                | (AwaitingHandler, Completed)
                | (AwaitingHandler, Faulted)
        )
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StageCell(Arc<Mutex<InvocationStage>>);

impl StageCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(InvocationStage::Created)))
    }

    fn advance(&self, next: InvocationStage) {
        let mut stage = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(
            stage.can_advance_to(next),
            "invalid invocation stage transition from {:?} to {:?}",
            *stage,
            next
        );
        tracing::trace!(from = ?*stage, to = ?next, "invocation stage advanced");
        *stage = next;
    }

    #[cfg(test)]
    pub(crate) fn get(&self) -> InvocationStage {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds an operation back until the call's pending validation outcome
/// settles
///
/// If the outcome settles as failed, the wrapped invoker is never called and
/// the caller receives a fault built by the configured [`FaultTranslator`].
/// Calls without a pending outcome go straight through. Handler results and
/// errors pass through unchanged.
#[derive(Clone, Debug)]
pub struct CompletionInvoker {
    inner: Arc<dyn OperationInvoker>,
    translator: Arc<dyn FaultTranslator>,
}

impl CompletionInvoker {
    /// Wraps an invoker, reporting failures with the
    /// [`VerboseFaultTranslator`]
    pub fn new(inner: Arc<dyn OperationInvoker>) -> Self {
        Self {
            inner,
            translator: Arc::new(VerboseFaultTranslator),
        }
    }

    /// Replaces the fault translator
    pub fn with_translator<T>(self, translator: T) -> Self
    where
        T: FaultTranslator + 'static,
    {
        self.with_shared_translator(Arc::new(translator))
    }

    /// Replaces the fault translator with a shared one
    pub fn with_shared_translator(self, translator: Arc<dyn FaultTranslator>) -> Self {
        Self { translator, ..self }
    }

    /// The wrapped invoker
    #[inline]
    pub fn inner(&self) -> &Arc<dyn OperationInvoker> {
        &self.inner
    }

    pub(crate) fn begin_tracked(
        &self,
        invocation: Invocation,
        callback: Option<AsyncCallback>,
        state: Option<AsyncState>,
    ) -> (AsyncResult, StageCell) {
        let stage = StageCell::new();
        let result = AsyncResult::begin(callback, state, |completer| {
            PendingInvocation {
                inner: Arc::clone(&self.inner),
                translator: Arc::clone(&self.translator),
                stage: stage.clone(),
                completer,
            }
            .start(invocation);
        });

        (result, stage)
    }
}

impl OperationInvoker for CompletionInvoker {
    fn allocate_inputs(&self) -> Vec<Value> {
        self.inner.allocate_inputs()
    }

    fn invoke(&self, mut invocation: Invocation) -> Result<InvokeOutput, InvokeError> {
        if let Some(outcome) = invocation.call.take_pending_outcome()? {
            tracing::trace!("waiting on pending validation");
            if let Err(err) = outcome.wait() {
                return Err(translate_failure(self.translator.as_ref(), &err));
            }
        }

        self.inner.invoke(invocation)
    }

    fn invoke_begin(
        &self,
        invocation: Invocation,
        callback: Option<AsyncCallback>,
        state: Option<AsyncState>,
    ) -> AsyncResult {
        self.begin_tracked(invocation, callback, state).0
    }

    fn is_synchronous(&self) -> bool {
        self.inner.is_synchronous()
    }
}

fn translate_failure(translator: &dyn FaultTranslator, err: &ValidationError) -> InvokeError {
    let error: &(dyn error::Error + 'static) = err;
    let fault = translator.translate(error);
    tracing::debug!(error, reason = fault.reason(), "deferred validation failed");
    InvokeError::Fault(FaultError::from(fault))
}

struct PendingInvocation {
    inner: Arc<dyn OperationInvoker>,
    translator: Arc<dyn FaultTranslator>,
    stage: StageCell,
    completer: Completer,
}

impl PendingInvocation {
    fn start(self, mut invocation: Invocation) {
        match invocation.call.take_pending_outcome() {
            Err(err) => self.fault(err.into()),
            Ok(None) => {
                tracing::trace!("no pending validation");
                self.begin_handler(invocation);
            }
            Ok(Some(outcome)) => {
                self.stage.advance(InvocationStage::AwaitingAuth);
                outcome.on_settled(move |result| self.on_validation_settled(result, invocation));
            }
        }
    }

    fn on_validation_settled(self, result: Result<(), ValidationError>, invocation: Invocation) {
        match result {
            Ok(()) => self.begin_handler(invocation),
            Err(err) => {
                let error = translate_failure(self.translator.as_ref(), &err);
                self.fault(error);
            }
        }
    }

    fn fault(self, error: InvokeError) {
        self.stage.advance(InvocationStage::Faulted);
        self.completer.complete(Err(error));
    }

    fn begin_handler(self, invocation: Invocation) {
        self.stage.advance(InvocationStage::AwaitingHandler);

        let Self {
            inner,
            stage,
            completer,
            ..
        } = self;

        let handler = Arc::new(HandlerCompletion {
            inner: Arc::clone(&inner),
            stage,
            completer: Mutex::new(Some(completer)),
        });

        let deferred = Arc::clone(&handler);
        let callback: AsyncCallback = Box::new(move |result: &AsyncResult| {
            if !result.completed_synchronously() {
                deferred.finish(result);
            }
        });

        let result = inner.invoke_begin(invocation, Some(callback), None);
        if result.completed_synchronously() {
            handler.finish(&result);
        }
    }
}

struct HandlerCompletion {
    inner: Arc<dyn OperationInvoker>,
    stage: StageCell,
    completer: Mutex<Option<Completer>>,
}

impl HandlerCompletion {
    fn finish(&self, result: &AsyncResult) {
        let completer = self
            .completer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(completer) = completer else {
            return;
        };

        let outcome = self.inner.invoke_end(result);
        self.stage.advance(if outcome.is_ok() {
            InvocationStage::Completed
        } else {
            InvocationStage::Faulted
        });
        completer.complete(outcome);
    }
}
