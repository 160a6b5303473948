//! Result algebra for step operations.
//!
//! A step operation returns `Result<T, R>` where `R: Into<Fault<E>>`. The
//! common case is returning the domain error `E` directly; [`Fault`] exists so
//! an operation can also attach a diagnostic cause, report a thrown error, or
//! raise one of the human-in-the-loop suspension shapes.

use durastep_types::error::{ApprovalRejected, PendingApproval, PendingHook};
use durastep_types::step::{Cause, ExceptionRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Values a step can produce. They are cached and snapshotted as JSON.
pub trait StepValue: Serialize + DeserializeOwned + Send + 'static {}

impl<T> StepValue for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// Typed domain errors declared by a workflow author.
pub trait DomainError:
    Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static
{
}

impl<E> DomainError for E where
    E: Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static
{
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// The failure half of `ok(value) | err(error, cause?)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure<E> {
    pub error: E,
    /// Diagnostic only; never type-checked.
    pub cause: Option<Cause>,
}

impl<E> Failure<E> {
    pub fn new(error: E) -> Self {
        Self { error, cause: None }
    }

    pub fn with_cause(error: E, cause: Cause) -> Self {
        Self {
            error,
            cause: Some(cause),
        }
    }

    /// Transform the error while keeping the cause.
    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> Failure<F> {
        Failure {
            error: f(self.error),
            cause: self.cause,
        }
    }
}

/// `Result` specialised to carry a [`Failure`].
pub type Outcome<T, E> = Result<T, Failure<E>>;

pub fn ok<T, E>(value: T) -> Outcome<T, E> {
    Ok(value)
}

pub fn err<T, E>(error: E) -> Outcome<T, E> {
    Err(Failure::new(error))
}

pub fn err_with_cause<T, E>(error: E, cause: Cause) -> Outcome<T, E> {
    Err(Failure::with_cause(error, cause))
}

// ---------------------------------------------------------------------------
// Fault
// ---------------------------------------------------------------------------

/// Every way a step operation can fail.
#[derive(Debug)]
pub enum Fault<E> {
    /// The operation returned a typed failure (origin `result`).
    Returned(Failure<E>),
    /// The operation threw (origin `throw`). Routed through the unexpected-error mapper.
    Thrown(anyhow::Error),
    /// Suspend pending a human decision.
    PendingApproval(PendingApproval),
    /// Suspend pending an external callback.
    PendingHook(PendingHook),
    /// A human rejected the approval.
    Rejected(ApprovalRejected),
}

impl<E> Fault<E> {
    pub fn returned(error: E) -> Self {
        Fault::Returned(Failure::new(error))
    }

    pub fn with_cause(error: E, cause: Cause) -> Self {
        Fault::Returned(Failure::with_cause(error, cause))
    }

    pub fn thrown(err: impl Into<anyhow::Error>) -> Self {
        Fault::Thrown(err.into())
    }

    pub fn from_failure(failure: Failure<E>) -> Self {
        Fault::Returned(failure)
    }
}

impl<E> From<E> for Fault<E> {
    fn from(error: E) -> Self {
        Fault::returned(error)
    }
}

/// Build a structured exception cause from a thrown `anyhow` error.
pub(crate) fn thrown_cause(err: &anyhow::Error) -> Cause {
    let head: &(dyn std::error::Error + 'static) = err.as_ref();
    Cause::Exception(ExceptionRecord::from_dyn(head))
}

/// Build a thrown-value cause from a caught panic payload.
pub(crate) fn panic_cause(payload: &(dyn std::any::Any + Send)) -> Cause {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    };
    Cause::thrown(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use durastep_types::step::NamedError;

    #[derive(Debug, Clone, PartialEq)]
    enum PayError {
        Declined,
    }

    #[test]
    fn helpers_build_results() {
        let good: Outcome<u32, PayError> = ok(3);
        assert_eq!(good, Ok(3));

        let bad: Outcome<u32, PayError> = err_with_cause(PayError::Declined, Cause::domain("card"));
        let failure = bad.unwrap_err();
        assert_eq!(failure.error, PayError::Declined);
        assert_eq!(failure.cause, Some(Cause::domain("card")));
    }

    #[test]
    fn failure_map_keeps_cause() {
        let failure = Failure::with_cause(PayError::Declined, Cause::domain("x"));
        let mapped = failure.map(|_| "declined");
        assert_eq!(mapped.error, "declined");
        assert_eq!(mapped.cause, Some(Cause::domain("x")));
    }

    #[test]
    fn domain_error_converts_into_returned_fault() {
        let fault: Fault<PayError> = PayError::Declined.into();
        assert!(matches!(
            fault,
            Fault::Returned(Failure {
                error: PayError::Declined,
                cause: None
            })
        ));
    }

    #[test]
    fn thrown_cause_records_chain() {
        let err = anyhow::anyhow!("socket closed").context("fetching invoice");
        let cause = thrown_cause(&err);
        match cause {
            Cause::Exception(rec) => {
                assert_eq!(rec.name, "socket closed");
                assert_eq!(rec.message, "fetching invoice");
                assert_eq!(rec.chain, vec!["socket closed".to_string()]);
            }
            other => panic!("expected exception cause, got {other:?}"),
        }
    }

    #[test]
    fn thrown_cause_uses_a_supplied_name() {
        let err = anyhow::Error::new(NamedError::new("LedgerLocked", "row busy"))
            .context("posting refund");
        match thrown_cause(&err) {
            Cause::Exception(rec) => {
                assert_eq!(rec.name, "LedgerLocked");
                assert_eq!(rec.message, "posting refund");
                assert_eq!(rec.chain, vec!["row busy".to_string()]);
            }
            other => panic!("expected exception cause, got {other:?}"),
        }
    }

    #[test]
    fn panic_cause_reads_string_payloads() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("exploded");
        assert_eq!(panic_cause(payload.as_ref()), Cause::thrown("exploded"));

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_cause(payload.as_ref()), Cause::thrown("owned"));
    }
}
