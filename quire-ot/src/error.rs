use thiserror::Error;

/// Errors raised while building, decoding or combining text operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    /// The operation is structurally invalid (bad encoding, empty or
    /// non-canonical components, overlapping ranges).
    #[error("malformed operation: {0}")]
    Malformed(String),

    /// The operation was applied to, or combined with, something of the wrong length.
    #[error("length mismatch: expected {expected} characters, found {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

impl OtError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        OtError::Malformed(reason.into())
    }
}
