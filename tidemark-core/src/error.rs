//! Error types for Tidemark operations.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Extract the full error message from a tokio_postgres::Error,
/// including the underlying DbError details that Display hides.
pub fn format_db_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = db_err.message().to_string();
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  Detail: {}", detail));
        }
        if let Some(hint) = db_err.hint() {
            msg.push_str(&format!("\n  Hint: {}", hint));
        }
        if let Some(position) = db_err.position() {
            msg.push_str(&format!("\n  Position: {:?}", position));
        }
        return msg;
    }
    // Fallback: walk the source chain
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        msg.push_str(&format!(": {}", s));
        source = s.source();
    }
    if e.is_closed() {
        msg.push_str("\n  Note: The database connection was closed unexpectedly. This may indicate a network issue or server restart.");
    }
    msg
}

/// The stage of a pass in which an abort happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Validation,
    Precondition,
    Execution,
    Rollback,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Validation => write!(f, "validation"),
            Phase::Precondition => write!(f, "precondition"),
            Phase::Execution => write!(f, "execution"),
            Phase::Rollback => write!(f, "rollback"),
        }
    }
}

/// A single finding of the validation sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    /// Two change sets share the same `(id, author, path)` triple.
    DuplicateIdentity { change_set: String },
    /// A change set was modified after it was applied.
    ChecksumDrift {
        change_set: String,
        stored: String,
        computed: String,
    },
    /// The id or author of a change set is blank.
    MissingIdentity { change_set: String, field: String },
    /// A change inside the change set rejected its own definition.
    InvalidChange { change_set: String, reason: String },
    /// `run_in_transaction = false` cannot be honoured inside a batch transaction.
    NonTransactionalInBatch { change_set: String },
}

impl ValidationIssue {
    /// Identity triple of the offending change set, as `path::id::author`.
    pub fn change_set(&self) -> &str {
        match self {
            ValidationIssue::DuplicateIdentity { change_set }
            | ValidationIssue::ChecksumDrift { change_set, .. }
            | ValidationIssue::MissingIdentity { change_set, .. }
            | ValidationIssue::InvalidChange { change_set, .. }
            | ValidationIssue::NonTransactionalInBatch { change_set } => change_set,
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::DuplicateIdentity { change_set } => {
                write!(f, "{} is declared more than once", change_set)
            }
            ValidationIssue::ChecksumDrift {
                change_set,
                stored,
                computed,
            } => write!(
                f,
                "{} was: {} but is now: {}",
                change_set, stored, computed
            ),
            ValidationIssue::MissingIdentity { change_set, field } => {
                write!(f, "{} has an empty {}", change_set, field)
            }
            ValidationIssue::InvalidChange { change_set, reason } => {
                write!(f, "{} is invalid: {}", change_set, reason)
            }
            ValidationIssue::NonTransactionalInBatch { change_set } => write!(
                f,
                "{} sets run_in_transaction = false, which batch_transaction cannot honour",
                change_set
            ),
        }
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("  - {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

/// All error types that Tidemark operations can produce.
#[derive(Error, Debug)]
pub enum TidemarkError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A PostgreSQL query or connection operation failed.
    #[error("Database error: {}", format_db_error(.0))]
    DatabaseError(#[from] tokio_postgres::Error),

    /// A backend rejected a statement (used by backends without a native error type).
    #[error("Statement failed: {0}")]
    StatementFailed(String),

    /// A changelog document could not be read into the model.
    #[error("Changelog parse error: {0}")]
    ChangelogParseError(String),

    /// A changelog references a change tag that no factory is registered for.
    #[error("Unknown change type '{kind}'. Registered: {available}")]
    UnknownChangeType { kind: String, available: String },

    /// The validation sweep found problems. Nothing was executed.
    #[error("[validation] Validation failed with {} issue(s):\n{}", .0.len(), format_issues(.0))]
    ValidationFailed(Vec<ValidationIssue>),

    /// A precondition evaluated to false under a HALT policy.
    #[error("[precondition] Precondition failed for {target}: {reason}")]
    PreconditionFailed { target: String, reason: String },

    /// A precondition could not be evaluated under a HALT policy.
    #[error("[precondition] Precondition error for {target}: {reason}")]
    PreconditionError { target: String, reason: String },

    /// The changelog lock stayed held by another process for the whole wait.
    #[error("Could not acquire change log lock after {waited_secs}s. Currently locked by {holder} since {granted}")]
    LockTimeout {
        holder: String,
        granted: String,
        waited_secs: u64,
    },

    /// The lock table could not be read or written.
    #[error("Lock error: {0}")]
    LockError(String),

    /// A change set's statements failed mid-pass.
    #[error("[execution] Change set {change_set} failed: {reason}")]
    ExecutionFailed { change_set: String, reason: String },

    /// A requested rollback needs an inverse that the change set does not provide.
    #[error("[rollback] Change set {change_set} cannot be rolled back: {reason}")]
    RollbackUnsupported { change_set: String, reason: String },

    /// The inverse statements of a change set failed.
    #[error("[rollback] Rollback of change set {change_set} failed: {reason}")]
    RollbackFailed { change_set: String, reason: String },

    /// The rollback target does not name an applied point in the ledger.
    #[error("[rollback] Invalid rollback target: {0}")]
    RollbackTargetInvalid(String),

    /// A filesystem I/O operation failed.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The database connection was lost during an operation.
    #[error("Connection lost during {operation}: {detail}")]
    ConnectionLost { operation: String, detail: String },
}

impl TidemarkError {
    /// The phase of the pass this error aborted, if it is a pass-level abort.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            TidemarkError::ValidationFailed(_) => Some(Phase::Validation),
            TidemarkError::PreconditionFailed { .. } | TidemarkError::PreconditionError { .. } => {
                Some(Phase::Precondition)
            }
            TidemarkError::ExecutionFailed { .. } => Some(Phase::Execution),
            TidemarkError::RollbackUnsupported { .. }
            | TidemarkError::RollbackFailed { .. }
            | TidemarkError::RollbackTargetInvalid(_) => Some(Phase::Rollback),
            _ => None,
        }
    }
}

/// Convenience type alias for `Result<T, TidemarkError>`.
pub type Result<T> = std::result::Result<T, TidemarkError>;
