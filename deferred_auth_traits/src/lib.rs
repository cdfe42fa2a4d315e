//! Deferred credential validation
//!
//! A [`ValidationOutcome`] is a single-assignment result that lets a
//! validator report its verdict some time after it was asked, without
//! blocking the thread that asked. Validators come in three shapes:
//!
//! * [`AsyncValidator`]: returns an outcome immediately, settling it later
//! * [`SyncValidator`]: the classic blocking check
//! * [`CredentialCheck`]: an `async fn`, adapted into an [`AsyncValidator`]
//!   by [`Spawned`]
//!
//! ```
//! use deferred_auth_traits::{AsyncValidator, ValidationError, ValidationOutcome};
//!
//! struct Directory;
//!
//! impl AsyncValidator for Directory {
//!     fn validate(&self, username: &str, password: &str) -> ValidationOutcome {
//!         if username.is_empty() {
//!             return ValidationOutcome::failed(ValidationError::new("missing user name"));
//!         }
//!
//!         let (settler, outcome) = ValidationOutcome::channel();
//!         let accepted = password == "hunter2";
//!         std::thread::spawn(move || {
//!             if accepted {
//!                 settler.succeed();
//!             } else {
//!                 settler.fail(ValidationError::new("invalid password"));
//!             }
//!         });
//!         outcome
//!     }
//! }
//!
//! let outcome = Directory.validate("ada", "hunter2");
//! assert!(outcome.wait().is_ok());
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
    unused_must_use
)]
#![forbid(unsafe_code)]

mod outcome;
mod validator;

pub use outcome::{OutcomeSettler, ValidationError, ValidationOutcome};
#[cfg(feature = "tokio")]
pub use validator::Spawned;
pub use validator::{AsyncValidator, CredentialCheck, SyncValidator};
