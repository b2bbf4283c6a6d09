use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed or empty identifiers and request payloads.
    InvalidInput(String),
    /// An expense with this id already exists.
    Duplicate(String),
    /// Unknown id on lookup or on a consumed continuation.
    NotFound(String),
    /// The requested operation is invalid in the current state.
    InvalidState(String),
    /// Network or remote hiccup worth retrying within the step budget.
    Transient(String),
    /// A step or suspension exceeded its deadline.
    Timeout { step: String, after: Duration },
    /// A decision arrived for an expense with no live registration.
    UnknownExpense(String),
    /// A collaborator answered with an `ERROR:<reason>` marker we do not map.
    Remote { reason: String },
    /// A persistence layer error (database, serialization).
    Persistence(String),
    /// A configuration error occurred.
    Config(String),
    /// A generic system or unknown error.
    System(String),
}

impl Error {
    /// Only transient failures are retried by the step executor.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Reason half of the `ERROR:<REASON>` marker used on the HTTP surface.
    pub fn marker_reason(&self) -> &str {
        match self {
            Error::InvalidInput(_) => "INVALID_FORM_DATA",
            Error::Duplicate(_) => "DUPLICATE_ID",
            Error::NotFound(_) | Error::UnknownExpense(_) => "INVALID_ID",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::Remote { reason } => reason,
            Error::Timeout { .. } => "TIMEOUT",
            Error::Transient(_)
            | Error::Persistence(_)
            | Error::Config(_)
            | Error::System(_) => "INTERNAL",
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Error::InvalidInput(_) => FailureKind::InvalidInput,
            Error::Duplicate(_) => FailureKind::Duplicate,
            Error::NotFound(_) => FailureKind::NotFound,
            Error::InvalidState(_) => FailureKind::InvalidState,
            Error::Transient(_) => FailureKind::Transient,
            Error::Timeout { .. } => FailureKind::Timeout,
            Error::UnknownExpense(_) => FailureKind::UnknownExpense,
            Error::Remote { .. } => FailureKind::Remote,
            Error::Persistence(_) | Error::Config(_) | Error::System(_) => FailureKind::System,
        }
    }

    /// Detail recorded in a failed run's result. Remote failures keep the bare
    /// reason so callers can branch on it (e.g. `DECLINED`).
    pub fn detail(&self) -> String {
        match self {
            Error::Remote { reason } => reason.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidInput(msg) => write!(f, "Invalid input: {msg}"),
            Error::Duplicate(id) => write!(f, "Duplicate id: {id}"),
            Error::NotFound(what) => write!(f, "Not found: {what}"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {msg}"),
            Error::Transient(msg) => write!(f, "Transient failure: {msg}"),
            Error::Timeout { step, after } => {
                write!(f, "Step {step} timed out after {}ms", after.as_millis())
            }
            Error::UnknownExpense(id) => write!(f, "No live registration for expense {id}"),
            Error::Remote { reason } => write!(f, "Remote failure: {reason}"),
            Error::Persistence(msg) => write!(f, "Persistence error: {msg}"),
            Error::Config(msg) => write!(f, "Configuration error: {msg}"),
            Error::System(msg) => write!(f, "System error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// Serializable failure category stored with a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidInput,
    Duplicate,
    NotFound,
    InvalidState,
    Transient,
    Timeout,
    UnknownExpense,
    Remote,
    System,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::Duplicate => "duplicate",
            FailureKind::NotFound => "not_found",
            FailureKind::InvalidState => "invalid_state",
            FailureKind::Transient => "transient",
            FailureKind::Timeout => "timeout",
            FailureKind::UnknownExpense => "unknown_expense",
            FailureKind::Remote => "remote",
            FailureKind::System => "system",
        }
    }
}
