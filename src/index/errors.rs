//! Error types for the attribute index subsystem
//!
//! Every error carries a stable code and a severity:
//! - User-data conflicts (uniqueness, ownership) are ERROR and surfaced to the caller
//! - Malformed calls are ERROR (`IDX_INVALID_USAGE`)
//! - Broken structural premises are FATAL: the structure must not be used or persisted

use thiserror::Error;

use crate::observability::{Logger, Severity};

/// Attribute index error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// Value is already owned by a different record
    #[error(
        "[IDX_UNIQUE_VALUE_VIOLATION] value `{value}` of attribute `{attribute}`{} is already owned by {existing_owner}, cannot assign it to {requested_owner}",
        locale_suffix(.locale)
    )]
    UniqueValueViolation {
        attribute: String,
        locale: Option<String>,
        value: String,
        existing_owner: String,
        requested_owner: String,
    },

    /// Removal of a value that is not owned by the expected record
    #[error(
        "[IDX_OWNERSHIP_MISMATCH] value `{value}` of attribute `{attribute}`{} is expected to be owned by {expected_owner}, but is owned by {}",
        locale_suffix(.locale),
        .actual_owner.as_deref().unwrap_or("nobody")
    )]
    OwnershipMismatch {
        attribute: String,
        locale: Option<String>,
        value: String,
        expected_owner: String,
        actual_owner: Option<String>,
    },

    /// Caller error: wrong type, range query on non-range index, self reference...
    #[error("[IDX_INVALID_USAGE] {0}")]
    InvalidUsage(String),

    /// Structural premise violated; the index is damaged
    #[error("[IDX_INTERNAL_CONSISTENCY] {0}")]
    InternalConsistency(String),

    /// Configuration could not be loaded or is invalid
    #[error("[IDX_CONFIG_INVALID] {0}")]
    Configuration(String),
}

fn locale_suffix(locale: &Option<String>) -> String {
    match locale {
        Some(locale) => format!(" in locale `{}`", locale),
        None => String::new(),
    }
}

impl IndexError {
    /// Create an invalid usage error
    pub fn invalid_usage(message: impl Into<String>) -> Self {
        IndexError::InvalidUsage(message.into())
    }

    /// Create an internal consistency error.
    ///
    /// Logged at FATAL immediately so the failure is visible even if the
    /// caller swallows the error.
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        Logger::fatal("INDEX_INTERNAL_CONSISTENCY", &[("reason", &message)]);
        IndexError::InternalConsistency(message)
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        IndexError::Configuration(message.into())
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            IndexError::UniqueValueViolation { .. } => "IDX_UNIQUE_VALUE_VIOLATION",
            IndexError::OwnershipMismatch { .. } => "IDX_OWNERSHIP_MISMATCH",
            IndexError::InvalidUsage(_) => "IDX_INVALID_USAGE",
            IndexError::InternalConsistency(_) => "IDX_INTERNAL_CONSISTENCY",
            IndexError::Configuration(_) => "IDX_CONFIG_INVALID",
        }
    }

    /// Severity of the error
    pub fn severity(&self) -> Severity {
        match self {
            IndexError::InternalConsistency(_) => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// Returns true if the index must not be used after this error
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

/// Fails with an internal consistency error unless `condition` holds
pub(crate) fn premise(condition: bool, message: impl FnOnce() -> String) -> IndexResult<()> {
    if condition {
        Ok(())
    } else {
        Err(IndexError::internal(message()))
    }
}

/// Fails with an invalid usage error unless `condition` holds
pub(crate) fn ensure(condition: bool, message: impl FnOnce() -> String) -> IndexResult<()> {
    if condition {
        Ok(())
    } else {
        Err(IndexError::InvalidUsage(message()))
    }
}

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;
