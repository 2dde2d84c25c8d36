//! Error types for selection evaluation.

use thiserror::Error;

/// Result type for selection evaluation.
pub type Result<T> = std::result::Result<T, SelectionError>;

/// Error raised while evaluating a selection tree against a frame.
///
/// Programmer preconditions (unsorted index groups, releasing a pool slot
/// that was never reserved, a modifier without a child) are asserted, not
/// reported through this type.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// The evaluator reached a combination of node and value kind that the
    /// engine does not support.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// An invariant of the evaluation machinery was violated.
    #[error("internal selection error: {0}")]
    Internal(String),

    /// A selection method callback failed; the message is the plugin's own.
    #[error("selection method '{method}' failed: {message}")]
    Method { method: String, message: String },
}

impl SelectionError {
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        SelectionError::Internal(message.into())
    }

    /// Wrap a plugin failure, keeping the plugin's classification visible.
    pub fn method(method: impl Into<String>, message: impl Into<String>) -> Self {
        SelectionError::Method {
            method: method.into(),
            message: message.into(),
        }
    }
}
