//! Validator capabilities for user name and password credentials

#[cfg(feature = "tokio")]
use std::{fmt, sync::Arc};

#[cfg(feature = "tokio")]
use tokio::runtime::Handle;

use async_trait::async_trait;

use crate::{ValidationError, ValidationOutcome};

/// A credential validator that reports its verdict through a
/// [`ValidationOutcome`] instead of blocking
///
/// `validate` is called at most once per call and must return promptly.
/// Any slow work (network calls, directory lookups, rate limiting) belongs
/// to the execution that eventually settles the outcome. A validator that
/// can reject synchronously returns an outcome that has already failed.
///
/// A single validator instance is shared by every concurrent call, so any
/// internal mutable state must be synchronized. Validators that need to
/// bound the time spent validating must enforce that timeout themselves and
/// settle as failed, as nothing upstream will cancel a pending outcome.
pub trait AsyncValidator: Send + Sync {
    /// Begins validating the credentials
    fn validate(&self, username: &str, password: &str) -> ValidationOutcome;
}

/// A credential validator that produces its verdict synchronously
pub trait SyncValidator: Send + Sync {
    /// Validates the credentials
    ///
    /// # Errors
    ///
    /// Returns an error describing why the credentials were rejected
    fn validate(&self, username: &str, password: &str) -> Result<(), ValidationError>;
}

/// A credential check written as an `async` function
///
/// Wrap an implementation in [`Spawned`] to use it as an [`AsyncValidator`].
#[async_trait]
pub trait CredentialCheck: Send + Sync {
    /// Checks the credentials
    ///
    /// # Errors
    ///
    /// Returns an error describing why the credentials were rejected
    async fn check(&self, username: &str, password: &str) -> Result<(), ValidationError>;
}

macro_rules! delegate_impls {
    ($($ty:ty)*) => {
        $(
            impl<T> AsyncValidator for $ty
            where
                T: AsyncValidator + ?Sized,
            {
                #[inline]
                fn validate(&self, username: &str, password: &str) -> ValidationOutcome {
                    T::validate(self, username, password)
                }
            }

            impl<T> SyncValidator for $ty
            where
                T: SyncValidator + ?Sized,
            {
                #[inline]
                fn validate(&self, username: &str, password: &str) -> Result<(), ValidationError> {
                    T::validate(self, username, password)
                }
            }
        )*
    }
}

delegate_impls!(
    &'_ T
    Box<T>
    std::sync::Arc<T>
);

/// Adapts a [`CredentialCheck`] into an [`AsyncValidator`] by running each
/// check as a tokio task
///
/// Checks that finish without suspending produce an outcome that is already
/// settled, so they take the same path as a synchronous validator. Checks
/// that suspend are spawned onto the runtime captured at construction, or
/// the runtime current at validation when none was captured. With no
/// runtime at all, a suspended check fails with
/// [`ValidationError::no_runtime`].
#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
pub struct Spawned<C> {
    check: Arc<C>,
    handle: Option<Handle>,
}

#[cfg(feature = "tokio")]
impl<C> Spawned<C> {
    /// Wraps a credential check, capturing the current tokio runtime if
    /// there is one
    pub fn new(check: C) -> Self {
        Self {
            check: Arc::new(check),
            handle: Handle::try_current().ok(),
        }
    }

    /// Wraps a credential check that runs on the given runtime
    ///
    /// Use this when validation is requested from threads outside of any
    /// runtime, such as blocking dispatch.
    pub fn with_handle(handle: Handle, check: C) -> Self {
        Self {
            check: Arc::new(check),
            handle: Some(handle),
        }
    }
}

#[cfg(feature = "tokio")]
impl<C> Clone for Spawned<C> {
    fn clone(&self) -> Self {
        Self {
            check: Arc::clone(&self.check),
            handle: self.handle.clone(),
        }
    }
}

#[cfg(feature = "tokio")]
impl<C> fmt::Debug for Spawned<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Spawned")
            .field("has_runtime", &self.handle.is_some())
            .finish()
    }
}

#[cfg(feature = "tokio")]
impl<C> AsyncValidator for Spawned<C>
where
    C: CredentialCheck + 'static,
{
    fn validate(&self, username: &str, password: &str) -> ValidationOutcome {
        let check = Arc::clone(&self.check);
        let username = username.to_owned();
        let password = password.to_owned();
        let future = async move { check.check(&username, &password).await };

        match &self.handle {
            Some(handle) => ValidationOutcome::spawn_on(handle, future),
            None => ValidationOutcome::spawn(future),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use color_eyre::Result;

    use super::*;

    struct DirectoryCheck {
        delay: Option<Duration>,
    }

    #[async_trait]
    impl CredentialCheck for DirectoryCheck {
        async fn check(&self, username: &str, password: &str) -> Result<(), ValidationError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if password == "test" {
                Ok(())
            } else {
                Err(ValidationError::new(format!(
                    "bad robot with user name {username}"
                )))
            }
        }
    }

    struct AllowList(&'static [&'static str]);

    impl SyncValidator for AllowList {
        fn validate(&self, username: &str, _: &str) -> Result<(), ValidationError> {
            if self.0.contains(&username) {
                Ok(())
            } else {
                Err(ValidationError::new("not on the allow list"))
            }
        }
    }

    #[tokio::test]
    async fn immediate_check_is_settled_on_return() {
        let validator = Spawned::new(DirectoryCheck { delay: None });

        let outcome = validator.validate("01", "test");
        assert!(matches!(outcome.peek(), Some(Ok(()))));

        let outcome = validator.validate("01", "nope");
        let err = outcome.peek().unwrap().unwrap_err();
        assert_eq!(err.message(), "bad robot with user name 01");
    }

    #[tokio::test]
    async fn slow_check_is_pending_on_return() -> Result<()> {
        let validator = Spawned::new(DirectoryCheck {
            delay: Some(Duration::from_millis(25)),
        });

        let outcome = validator.validate("02", "test");
        assert!(!outcome.is_settled());
        outcome.await?;
        Ok(())
    }

    #[tokio::test]
    async fn validators_delegate_through_smart_pointers() {
        let shared: Arc<dyn AsyncValidator> = Arc::new(Spawned::new(DirectoryCheck { delay: None }));
        assert!(matches!(shared.validate("03", "test").peek(), Some(Ok(()))));

        let boxed: Box<dyn SyncValidator> = Box::new(AllowList(&["admin"]));
        assert!(boxed.validate("admin", "").is_ok());
        assert!(boxed.validate("guest", "").is_err());
    }

    #[test]
    fn captured_runtime_drives_checks_requested_from_plain_threads() -> Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()?;
        let validator = Spawned::with_handle(
            runtime.handle().clone(),
            DirectoryCheck {
                delay: Some(Duration::from_millis(10)),
            },
        );

        let outcome = validator.validate("04", "nope");
        assert!(!outcome.is_settled());
        let err = outcome.wait().unwrap_err();
        assert_eq!(err.message(), "bad robot with user name 04");
        Ok(())
    }

    struct YieldingCheck;

    #[async_trait]
    impl CredentialCheck for YieldingCheck {
        async fn check(&self, _: &str, _: &str) -> Result<(), ValidationError> {
            tokio::task::yield_now().await;
            Ok(())
        }
    }

    #[test]
    fn suspended_check_without_a_runtime_fails() {
        let validator = Spawned::new(YieldingCheck);

        let err = validator.validate("05", "test").wait().unwrap_err();
        assert_eq!(err.message(), ValidationError::no_runtime().message());
    }
}
