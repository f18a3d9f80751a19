//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// The given string is not a valid, trackable hostname.
    #[error("invalid domain: {value}")]
    InvalidDomain { value: String },

    /// A required field was missing or had an out-of-range value.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

impl CoreError {
    /// Creates an invalid-field error from any displayable reason.
    pub fn invalid_field(field: &str, reason: impl std::fmt::Display) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for domain operations.
pub type CoreResult<T> = Result<T, CoreError>;
