//! Single-assignment outcomes of deferred credential validation

use std::{
    error, fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
};

#[cfg(feature = "tokio")]
use futures::FutureExt;

/// An error produced by a validator that rejected a set of credentials
///
/// The error is cheap to clone so that every observer of a
/// [`ValidationOutcome`] sees the same failure.
#[derive(Clone)]
pub struct ValidationError {
    message: Arc<str>,
    source: Option<Arc<dyn error::Error + Send + Sync + 'static>>,
}

impl ValidationError {
    /// Constructs a new validation error with a human-readable message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into().into(),
            source: None,
        }
    }

    /// Constructs a validation error from an underlying error
    ///
    /// The message of the validation error is the `Display` form of `error`,
    /// and `error` is retained as the source.
    pub fn from_error<E>(error: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self {
            message: error.to_string().into(),
            source: Some(Arc::new(error)),
        }
    }

    /// Attaches an underlying cause to this error
    pub fn with_source<E>(self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self {
            message: self.message,
            source: Some(Arc::new(source)),
        }
    }

    /// The error returned to observers when a validator drops its settler
    /// without ever producing a result
    pub fn abandoned() -> Self {
        Self::new("credential validation was abandoned before producing an outcome")
    }

    /// The error returned when a validation suspends with no tokio runtime
    /// available to finish it
    #[cfg(feature = "tokio")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
    pub fn no_runtime() -> Self {
        Self::new("credential validation suspended with no tokio runtime to complete it")
    }

    /// The human-readable message describing the rejection
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Attempts to view the underlying cause as a concrete error type
    pub fn downcast_source_ref<E>(&self) -> Option<&E>
    where
        E: error::Error + 'static,
    {
        self.source.as_deref()?.downcast_ref::<E>()
    }
}

impl fmt::Debug for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ValidationError")
            .field("message", &self.message)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl error::Error for ValidationError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.source {
            Some(source) => Some(&**source),
            None => None,
        }
    }
}

type Continuation = Box<dyn FnOnce(Result<(), ValidationError>) + Send + 'static>;

enum State {
    Pending {
        continuations: Vec<Continuation>,
        wakers: Vec<Waker>,
    },
    Settled(Result<(), ValidationError>),
}

struct Shared {
    state: Mutex<State>,
    settled: Condvar,
}

impl Shared {
    fn new(state: State) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            settled: Condvar::new(),
        })
    }

    // State changes are single assignments, so a panic while holding the
    // lock cannot leave a torn state behind.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, result: Result<(), ValidationError>) -> bool {
        let (continuations, wakers) = {
            let mut guard = self.lock();
            match std::mem::replace(&mut *guard, State::Settled(result.clone())) {
                State::Pending {
                    continuations,
                    wakers,
                } => (continuations, wakers),
                State::Settled(existing) => {
                    *guard = State::Settled(existing);
                    return false;
                }
            }
        };

        self.settled.notify_all();
        wakers.into_iter().for_each(Waker::wake);
        for continuation in continuations {
            continuation(result.clone());
        }

        true
    }
}

/// The deferred result of a single credential validation attempt
///
/// An outcome starts out _pending_ and settles exactly once, either as
/// succeeded or as failed with a [`ValidationError`]. Once settled it never
/// changes. Any number of observers may inspect, block on, await, or attach
/// continuations to the same outcome and all of them see the same terminal
/// state.
///
/// Outcomes belong to a single call. They are never reset or reused.
///
/// ```
/// use deferred_auth_traits::{ValidationError, ValidationOutcome};
///
/// let (settler, outcome) = ValidationOutcome::channel();
/// assert!(outcome.peek().is_none());
///
/// settler.fail(ValidationError::new("unknown user"));
///
/// let error = outcome.wait().unwrap_err();
/// assert_eq!(error.message(), "unknown user");
/// ```
#[derive(Clone)]
#[must_use]
pub struct ValidationOutcome {
    shared: Arc<Shared>,
}

impl ValidationOutcome {
    /// Creates a pending outcome along with the only handle able to settle it
    pub fn channel() -> (OutcomeSettler, Self) {
        let shared = Shared::new(State::Pending {
            continuations: Vec::new(),
            wakers: Vec::new(),
        });

        let settler = OutcomeSettler {
            shared: Some(Arc::clone(&shared)),
        };

        (settler, Self { shared })
    }

    /// An outcome that has already succeeded
    pub fn succeeded() -> Self {
        Self::from(Ok(()))
    }

    /// An outcome that has already failed
    pub fn failed(error: ValidationError) -> Self {
        Self::from(Err(error))
    }

    /// Runs `future` to produce the outcome
    ///
    /// The future is polled once immediately. If it completes without
    /// suspending, the returned outcome is already settled. Otherwise the
    /// remainder of the future is spawned onto the current tokio runtime
    /// and the returned outcome settles when it completes.
    ///
    /// If the future suspends outside of a tokio runtime, there is nothing
    /// to drive it and the returned outcome has already failed.
    #[cfg(feature = "tokio")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<(), ValidationError>> + Send + 'static,
    {
        let handle = tokio::runtime::Handle::try_current().ok();
        Self::spawn_with(future, handle.as_ref())
    }

    /// Runs `future` to produce the outcome, spawning onto the given runtime
    /// if it does not complete immediately
    #[cfg(feature = "tokio")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
    pub fn spawn_on<F>(handle: &tokio::runtime::Handle, future: F) -> Self
    where
        F: Future<Output = Result<(), ValidationError>> + Send + 'static,
    {
        Self::spawn_with(future, Some(handle))
    }

    #[cfg(feature = "tokio")]
    fn spawn_with<F>(future: F, handle: Option<&tokio::runtime::Handle>) -> Self
    where
        F: Future<Output = Result<(), ValidationError>> + Send + 'static,
    {
        let mut future = Box::pin(future);
        let ready = match handle {
            Some(handle) => {
                let _entered = handle.enter();
                (&mut future).now_or_never()
            }
            None => (&mut future).now_or_never(),
        };

        if let Some(result) = ready {
            tracing::trace!(
                succeeded = result.is_ok(),
                "validation completed without suspending"
            );
            return Self::from(result);
        }

        let Some(handle) = handle else {
            tracing::warn!("validation suspended outside of a tokio runtime");
            return Self::failed(ValidationError::no_runtime());
        };

        let (settler, outcome) = Self::channel();
        let _ = handle.spawn(async move {
            settler.settle(future.await);
        });

        outcome
    }

    /// Whether the outcome has settled
    pub fn is_settled(&self) -> bool {
        matches!(&*self.shared.lock(), State::Settled(_))
    }

    /// Returns the terminal result if the outcome has settled, without
    /// blocking
    pub fn peek(&self) -> Option<Result<(), ValidationError>> {
        match &*self.shared.lock() {
            State::Settled(result) => Some(result.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Blocks the current thread until the outcome settles
    ///
    /// Only hosts without any notion of suspension should use this. There is
    /// no timeout: a validator that never settles stalls the caller
    /// indefinitely.
    pub fn wait(&self) -> Result<(), ValidationError> {
        let mut guard = self.shared.lock();
        loop {
            if let State::Settled(result) = &*guard {
                return result.clone();
            }

            guard = self
                .shared
                .settled
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Registers a continuation to run with the terminal result
    ///
    /// If the outcome has already settled, `continuation` runs immediately
    /// on the current thread. Otherwise it runs on the thread that settles
    /// the outcome.
    pub fn on_settled<F>(&self, continuation: F)
    where
        F: FnOnce(Result<(), ValidationError>) + Send + 'static,
    {
        let result = {
            let mut guard = self.shared.lock();
            match &mut *guard {
                State::Pending { continuations, .. } => {
                    continuations.push(Box::new(continuation));
                    return;
                }
                State::Settled(result) => result.clone(),
            }
        };

        continuation(result);
    }

    /// Whether two handles observe the same validation attempt
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl From<Result<(), ValidationError>> for ValidationOutcome {
    fn from(result: Result<(), ValidationError>) -> Self {
        Self {
            shared: Shared::new(State::Settled(result)),
        }
    }
}

impl Future for ValidationOutcome {
    type Output = Result<(), ValidationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.shared.lock();
        match &mut *guard {
            State::Settled(result) => Poll::Ready(result.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl fmt::Debug for ValidationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.peek() {
            None => f.write_str("ValidationOutcome::Pending"),
            Some(Ok(())) => f.write_str("ValidationOutcome::Succeeded"),
            Some(Err(err)) => f
                .debug_tuple("ValidationOutcome::Failed")
                .field(&err.message())
                .finish(),
        }
    }
}

/// The write half of a pending [`ValidationOutcome`]
///
/// Settling consumes the settler, so an outcome can only ever be settled
/// once. A settler dropped without settling fails its outcome with
/// [`ValidationError::abandoned`].
#[must_use = "dropping a settler fails its outcome"]
pub struct OutcomeSettler {
    shared: Option<Arc<Shared>>,
}

impl OutcomeSettler {
    /// Settles the outcome as succeeded
    pub fn succeed(self) {
        self.settle(Ok(()));
    }

    /// Settles the outcome as failed
    pub fn fail(self, error: ValidationError) {
        self.settle(Err(error));
    }

    /// Settles the outcome with the given result
    pub fn settle(mut self, result: Result<(), ValidationError>) {
        if let Some(shared) = self.shared.take() {
            shared.settle(result);
        }
    }
}

impl Drop for OutcomeSettler {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            if shared.settle(Err(ValidationError::abandoned())) {
                tracing::warn!("validation outcome settler dropped without settling");
            }
        }
    }
}

impl fmt::Debug for OutcomeSettler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OutcomeSettler")
            .field("armed", &self.shared.is_some())
            .finish()
    }
}
