//! Step outcome types shared by the executor, the cache, and the wire format.
//!
//! There are two shapes for the same information:
//! - [`CacheEntry`] is what a step cache holds. A failure's cause may be wrapped
//!   in a [`CachedErrorCause`] carrying replay metadata.
//! - [`StepResult`] is the JSON-safe wire form used by snapshots and serialized
//!   resume state: `{ok:true, value}` or `{ok:false, error, cause, meta:{origin}}`.

use std::error::Error as StdError;
use std::fmt;
use std::iter::successors;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Origin / meta
// ---------------------------------------------------------------------------

/// How a failed step produced its failure.
///
/// A step that *returned* a failure and a step that *threw* must replay
/// identically from cache, so the distinction travels with every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    Result,
    Throw,
}

impl std::fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureOrigin::Result => write!(f, "result"),
            FailureOrigin::Throw => write!(f, "throw"),
        }
    }
}

/// Wire-level failure metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMeta {
    pub origin: FailureOrigin,
}

/// In-memory failure metadata, carrying the cause in the slot matching its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum StepFailureMeta {
    /// The operation returned a failure.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_cause: Option<Cause>,
    },
    /// The operation threw (returned a thrown error or panicked).
    Throw { thrown: Cause },
}

impl StepFailureMeta {
    pub fn origin(&self) -> FailureOrigin {
        match self {
            StepFailureMeta::Result { .. } => FailureOrigin::Result,
            StepFailureMeta::Throw { .. } => FailureOrigin::Throw,
        }
    }

    /// The cause stored in this meta, whichever slot it lives in.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            StepFailureMeta::Result { result_cause } => result_cause.as_ref(),
            StepFailureMeta::Throw { thrown } => Some(thrown),
        }
    }

    /// Rebuild the meta from the wire origin and the wire cause.
    pub fn from_wire(origin: FailureOrigin, cause: Option<Cause>) -> Self {
        match origin {
            FailureOrigin::Result => StepFailureMeta::Result {
                result_cause: cause,
            },
            FailureOrigin::Throw => StepFailureMeta::Throw {
                thrown: cause.unwrap_or(Cause::Thrown { value: Value::Null }),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Cause
// ---------------------------------------------------------------------------

/// Diagnostic cause attached to a failure. Never type-checked by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cause {
    /// Domain-provided diagnostic data.
    Domain { value: Value },
    /// A structured exception record (an error value with a message chain).
    Exception(ExceptionRecord),
    /// Any other thrown value (panic payloads, opaque values).
    Thrown { value: Value },
    /// Internal cache wrapper. Never appears on the wire.
    Cached(Box<CachedErrorCause>),
}

impl Cause {
    pub fn domain(value: impl Into<Value>) -> Self {
        Cause::Domain {
            value: value.into(),
        }
    }

    pub fn thrown(value: impl Into<Value>) -> Self {
        Cause::Thrown {
            value: value.into(),
        }
    }

    /// Build an exception record from any error, walking its source chain.
    pub fn from_error<E: StdError + ?Sized>(err: &E) -> Self {
        Cause::Exception(ExceptionRecord::from_error(err))
    }

    /// One-line human-readable summary.
    pub fn summary(&self) -> String {
        match self {
            Cause::Domain { value } | Cause::Thrown { value } => match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Cause::Exception(rec) => format!("{}: {}", rec.name, rec.message),
            Cause::Cached(wrapper) => wrapper
                .original_cause
                .as_ref()
                .map(Cause::summary)
                .unwrap_or_else(|| "cached failure".to_string()),
        }
    }
}

/// A structured exception: name, message, and the messages of its sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl ExceptionRecord {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            chain: Vec::new(),
        }
    }

    /// Named after `E`. Trait objects are named as in [`Self::from_dyn`].
    pub fn from_error<E: StdError + ?Sized>(err: &E) -> Self {
        let full = std::any::type_name::<E>();
        let sources: Vec<&(dyn StdError + 'static)> =
            successors(err.source(), |&s| s.source()).collect();
        let name = if full.starts_with("dyn ") {
            erased_name(None, &sources)
        } else {
            full.rsplit("::").next().unwrap_or(full).to_string()
        };
        Self {
            name,
            message: err.to_string(),
            chain: sources.iter().map(ToString::to_string).collect(),
        }
    }

    /// Record for a type-erased error. The name is taken from the first
    /// [`NamedError`] in the chain, else from the root cause's message, else
    /// `"Error"`.
    pub fn from_dyn(err: &(dyn StdError + 'static)) -> Self {
        let sources: Vec<&(dyn StdError + 'static)> =
            successors(err.source(), |&s| s.source()).collect();
        Self {
            name: erased_name(Some(err), &sources),
            message: err.to_string(),
            chain: sources.iter().map(ToString::to_string).collect(),
        }
    }
}

fn erased_name(
    head: Option<&(dyn StdError + 'static)>,
    sources: &[&(dyn StdError + 'static)],
) -> String {
    head.into_iter()
        .chain(sources.iter().copied())
        .find_map(|e| e.downcast_ref::<NamedError>().map(|n| n.name.clone()))
        .or_else(|| sources.last().map(ToString::to_string))
        .unwrap_or_else(|| "Error".to_string())
}

/// An error tagged with the name its [`ExceptionRecord`] should carry once
/// the concrete type is erased (behind `anyhow::Error` or `Box<dyn Error>`).
/// Display and sources pass through to the wrapped error.
#[derive(Debug)]
pub struct NamedError {
    pub name: String,
    inner: Box<dyn StdError + Send + Sync + 'static>,
}

impl NamedError {
    pub fn new(
        name: impl Into<String>,
        inner: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            name: name.into(),
            inner: inner.into(),
        }
    }
}

impl fmt::Display for NamedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for NamedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

/// Replay metadata wrapped around a cached failure's cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedErrorCause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_cause: Option<Cause>,
    pub meta: StepFailureMeta,
}

// ---------------------------------------------------------------------------
// Cache entry
// ---------------------------------------------------------------------------

/// A failure as held by a step cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedFailure {
    pub error: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Cause>,
}

/// What a step cache stores per key: the JSON form of the step's outcome.
pub type CacheEntry = Result<Value, CachedFailure>;

// ---------------------------------------------------------------------------
// StepResult (wire)
// ---------------------------------------------------------------------------

/// JSON-safe outcome of a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStepResult", into = "RawStepResult")]
pub enum StepResult {
    Ok {
        value: Value,
    },
    Err {
        error: Value,
        cause: Option<Cause>,
        meta: StepMeta,
    },
}

impl StepResult {
    pub fn ok(value: Value) -> Self {
        StepResult::Ok { value }
    }

    pub fn err(error: Value, cause: Option<Cause>, origin: FailureOrigin) -> Self {
        StepResult::Err {
            error,
            cause,
            meta: StepMeta { origin },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, StepResult::Ok { .. })
    }

    pub fn origin(&self) -> Option<FailureOrigin> {
        match self {
            StepResult::Ok { .. } => None,
            StepResult::Err { meta, .. } => Some(meta.origin),
        }
    }
}

/// Flat serde mirror of [`StepResult`] keyed on the `ok` discriminator.
#[derive(Serialize, Deserialize)]
struct RawStepResult {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
    #[serde(default)]
    cause: Option<Cause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<StepMeta>,
}

impl TryFrom<RawStepResult> for StepResult {
    type Error = String;

    fn try_from(raw: RawStepResult) -> Result<Self, Self::Error> {
        if raw.ok {
            return Ok(StepResult::Ok {
                value: raw.value.unwrap_or(Value::Null),
            });
        }
        let error = raw
            .error
            .ok_or_else(|| "failed step result is missing `error`".to_string())?;
        if matches!(raw.cause, Some(Cause::Cached(_))) {
            return Err("cache wrapper causes are not valid on the wire".to_string());
        }
        Ok(StepResult::Err {
            error,
            cause: raw.cause,
            meta: raw.meta.unwrap_or(StepMeta {
                origin: FailureOrigin::Result,
            }),
        })
    }
}

impl From<StepResult> for RawStepResult {
    fn from(result: StepResult) -> Self {
        match result {
            StepResult::Ok { value } => RawStepResult {
                ok: true,
                value: Some(value),
                error: None,
                cause: None,
                meta: None,
            },
            StepResult::Err { error, cause, meta } => RawStepResult {
                ok: false,
                value: None,
                error: Some(error),
                cause,
                meta: Some(meta),
            },
        }
    }
}
