//! Caller-visible faults for credentials rejected after dispatch began

use std::{error, fmt};

use serde::{Deserialize, Serialize};

/// Namespace of the SOAP 1.2 envelope, which defines the top-level fault codes
pub const SOAP_ENVELOPE_NAMESPACE: &str = "http://www.w3.org/2003/05/soap-envelope";

/// Namespace of the OASIS WS-Security 1.0 extension, which defines the
/// security fault sub-codes
pub const WS_SECURITY_NAMESPACE: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";

/// Addressing action attached to faults for addressing-aware transports
pub const FAULT_ACTION: &str = "http://www.w3.org/2005/08/addressing/soap/fault";

/// Top-level fault code for faults caused by the sender of a message
pub const SENDER: &str = "Sender";

/// WS-Security sub-code for a security token that could not be validated
pub const INVALID_SECURITY_TOKEN: &str = "InvalidSecurityToken";

/// The fixed leading text of every security token fault reason
pub const SECURITY_TOKEN_REASON: &str =
    "An error occurred when processing the security tokens in the message";

/// A qualified fault code, optionally refined by a more specific sub-code
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultCode {
    name: String,
    namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub_code: Option<Box<FaultCode>>,
}

impl FaultCode {
    /// Constructs a fault code without a sub-code
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            sub_code: None,
        }
    }

    /// Constructs a sender fault code refined by `sub_code`
    pub fn sender(sub_code: FaultCode) -> Self {
        Self {
            name: SENDER.into(),
            namespace: SOAP_ENVELOPE_NAMESPACE.into(),
            sub_code: Some(Box::new(sub_code)),
        }
    }

    /// The local name of the code
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The namespace qualifying the code
    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The more specific code refining this one, if any
    #[inline]
    pub fn sub_code(&self) -> Option<&FaultCode> {
        self.sub_code.as_deref()
    }

    /// Whether the fault was caused by the sender of the message
    pub fn is_sender_fault(&self) -> bool {
        self.name == SENDER && self.namespace == SOAP_ENVELOPE_NAMESPACE
    }

    /// The most specific code in the chain
    pub fn innermost(&self) -> &FaultCode {
        let mut code = self;
        while let Some(sub_code) = code.sub_code() {
            code = sub_code;
        }
        code
    }
}

/// A structured, caller-visible failure
///
/// A fault carries only its code, a human-readable reason, and the action
/// used by addressing-aware transports. It never carries the type or
/// backtrace of the internal error that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultRecord {
    code: FaultCode,
    reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<String>,
}

impl FaultRecord {
    /// Constructs a fault without an action
    pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            action: None,
        }
    }

    /// Constructs a sender fault with the `InvalidSecurityToken` sub-code and
    /// the standard fault action
    pub fn invalid_security_token(reason: impl Into<String>) -> Self {
        Self::new(
            FaultCode::sender(FaultCode::new(INVALID_SECURITY_TOKEN, WS_SECURITY_NAMESPACE)),
            reason,
        )
        .with_action(FAULT_ACTION)
    }

    /// Sets the addressing action of the fault
    pub fn with_action(self, action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            ..self
        }
    }

    /// The fault code
    #[inline]
    pub fn code(&self) -> &FaultCode {
        &self.code
    }

    /// The human-readable reason
    #[inline]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// The addressing action, if any
    #[inline]
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    /// Whether this fault reports an invalid security token
    pub fn is_invalid_security_token(&self) -> bool {
        let code = self.code.innermost();
        code.name() == INVALID_SECURITY_TOKEN && code.namespace() == WS_SECURITY_NAMESPACE
    }
}

/// An error that surfaces a [`FaultRecord`] to the caller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaultError(FaultRecord);

impl FaultError {
    /// The fault being surfaced
    #[inline]
    pub fn record(&self) -> &FaultRecord {
        &self.0
    }

    /// Extracts the fault being surfaced
    #[inline]
    pub fn into_record(self) -> FaultRecord {
        self.0
    }
}

impl From<FaultRecord> for FaultError {
    #[inline]
    fn from(record: FaultRecord) -> Self {
        Self(record)
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.0.reason())
    }
}

impl error::Error for FaultError {}

/// Converts an error observed while waiting on a validation outcome into the
/// fault returned to the caller
pub trait FaultTranslator: Send + Sync + fmt::Debug {
    /// Builds the fault for `error`
    fn translate(&self, error: &(dyn error::Error + 'static)) -> FaultRecord;
}

macro_rules! delegate_impls {
    ($($ty:ty)*) => {
        $(
            impl<T> FaultTranslator for $ty
            where
                T: FaultTranslator + ?Sized,
            {
                #[inline]
                fn translate(&self, error: &(dyn error::Error + 'static)) -> FaultRecord {
                    T::translate(self, error)
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

/// Produces `InvalidSecurityToken` faults whose reason includes the message
/// of the error that caused them
///
/// This is the default translator.
#[derive(Clone, Copy, Debug, Default)]
pub struct VerboseFaultTranslator;

impl FaultTranslator for VerboseFaultTranslator {
    fn translate(&self, error: &(dyn error::Error + 'static)) -> FaultRecord {
        FaultRecord::invalid_security_token(format!("{SECURITY_TOKEN_REASON}: {error}"))
    }
}

/// Produces `InvalidSecurityToken` faults with a fixed reason, withholding
/// the message of the error that caused them
#[derive(Clone, Copy, Debug, Default)]
pub struct TerseFaultTranslator;

impl FaultTranslator for TerseFaultTranslator {
    fn translate(&self, _: &(dyn error::Error + 'static)) -> FaultRecord {
        FaultRecord::invalid_security_token(SECURITY_TOKEN_REASON)
    }
}

#[cfg(test)]
mod tests {
    use deferred_auth_traits::ValidationError;

    use super::*;

    #[test]
    fn verbose_fault_embeds_the_error_message() {
        let error = ValidationError::new("Oops, bad robot with userName 01");
        let fault = VerboseFaultTranslator.translate(&error);

        assert_eq!(
            fault.reason(),
            "An error occurred when processing the security tokens in the message: Oops, bad robot with userName 01"
        );
        assert!(fault.is_invalid_security_token());
        assert!(fault.code().is_sender_fault());
        assert_eq!(fault.action(), Some(FAULT_ACTION));

        let sub_code = fault.code().sub_code().unwrap();
        assert_eq!(sub_code.name(), INVALID_SECURITY_TOKEN);
        assert_eq!(sub_code.namespace(), WS_SECURITY_NAMESPACE);
    }

    #[test]
    fn terse_fault_withholds_the_error_message() {
        let error = ValidationError::new("password hash mismatch for 01");
        let fault = TerseFaultTranslator.translate(&error);

        assert_eq!(fault.reason(), SECURITY_TOKEN_REASON);
        assert!(!fault.reason().contains("mismatch"));
        assert!(fault.is_invalid_security_token());
    }

    #[test]
    fn fault_does_not_expose_the_error_type() {
        let error = std::io::Error::new(std::io::ErrorKind::TimedOut, "directory timed out");
        let fault = VerboseFaultTranslator.translate(&error);

        assert!(fault.reason().ends_with(": directory timed out"));
        assert!(!fault.reason().contains("Custom"));
        assert!(!fault.reason().contains("TimedOut"));
    }

    #[test]
    fn fault_error_displays_the_reason() {
        let error = FaultError::from(FaultRecord::invalid_security_token("nope"));
        assert_eq!(error.to_string(), "nope");
        assert_eq!(error.into_record().reason(), "nope");
    }

    #[test]
    fn fault_serializes_with_nested_code() {
        let fault = FaultRecord::invalid_security_token("denied");
        let json = serde_json::to_value(&fault).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "code": {
                    "name": "Sender",
                    "namespace": SOAP_ENVELOPE_NAMESPACE,
                    "subCode": {
                        "name": "InvalidSecurityToken",
                        "namespace": WS_SECURITY_NAMESPACE,
                    },
                },
                "reason": "denied",
                "action": FAULT_ACTION,
            })
        );
    }

    #[test]
    fn innermost_code_without_sub_code_is_itself() {
        let code = FaultCode::new("Receiver", SOAP_ENVELOPE_NAMESPACE);
        assert_eq!(code.innermost(), &code);
        assert!(!code.is_sender_fault());
    }
}
