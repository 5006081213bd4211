//! Error types for value and path operations

use thiserror::Error;

/// Errors that can occur while parsing paths or editing values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A path string could not be parsed
    #[error("invalid path {input:?} at offset {offset}: {message}")]
    PathSyntax {
        /// The text that failed to parse
        input: String,
        /// Byte offset where parsing stopped
        offset: usize,
        /// What was expected
        message: String,
    },

    /// A path step does not apply to the value it was used on
    #[error("cannot apply {step} to a {found} value")]
    PathMismatch {
        /// The step that failed, rendered as text
        step: String,
        /// Type name of the value that was found
        found: &'static str,
    },

    /// A list index was beyond the end of the list
    #[error("index {index} out of range for list of length {len}")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Actual list length
        len: usize,
    },
}

/// Result type for value operations
pub type Result<T> = std::result::Result<T, Error>;
