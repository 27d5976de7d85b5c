use peerwarden_types::SkipReason;
use serde::Serialize;
use thiserror::Error;

use crate::exec::ExecError;

/// Stable error kind, for callers that translate errors into messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    NameConflict,
    Capacity,
    ValidationFailed,
    ExternalExecFailed,
    Skipped,
    AlreadyPresent,
    Suspended,
    Storage,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    #[error("owner {owner} already has a profile named {name:?}")]
    NameConflict { owner: i64, name: String },

    #[error("no free address left in {subnet}")]
    Capacity { subnet: String },

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("engine exec failed: {0}")]
    Exec(#[from] ExecError),

    #[error("{0} is already present")]
    AlreadyPresent(String),

    #[error("{0} is suspended")]
    Suspended(String),

    #[error("skipped: {0}")]
    Skipped(SkipReason),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

impl CoreError {
    pub fn not_found(what: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            key: key.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NameConflict { .. } => ErrorKind::NameConflict,
            Self::Capacity { .. } => ErrorKind::Capacity,
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::Exec(_) => ErrorKind::ExternalExecFailed,
            Self::AlreadyPresent(_) => ErrorKind::AlreadyPresent,
            Self::Suspended(_) => ErrorKind::Suspended,
            Self::Skipped(_) => ErrorKind::Skipped,
            Self::Storage(_) | Self::Json(_) => ErrorKind::Storage,
        }
    }

    /// The business reason when this error is a refusal rather than a failure.
    /// Batch accounting counts these as skipped.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::NotFound { .. } => Some(SkipReason::NotFound),
            Self::AlreadyPresent(_) => Some(SkipReason::AlreadyPresent),
            Self::Suspended(_) => Some(SkipReason::Suspended),
            Self::Skipped(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn is_skip(&self) -> bool {
        self.skip_reason().is_some()
    }
}
