//! Error types for device identity construction.

use thiserror::Error;

/// Errors that can occur while building a device identity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// A required identity field is empty
    #[error("Identity field '{field}' must not be empty")]
    EmptyField { field: &'static str },

    /// A field contains a character that would break topic or client id paths
    #[error("Identity field '{field}' contains an invalid character: {value:?}")]
    InvalidField { field: &'static str, value: String },

    /// Private key is not valid hex
    #[error("Private key is not valid hex: {0}")]
    KeyEncoding(String),

    /// Private key has the wrong size
    #[error("Invalid private key length: {actual} (expected {expected})")]
    KeyLength { expected: usize, actual: usize },
}

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;
