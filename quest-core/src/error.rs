//! Errors in the library.
use thiserror::Error;

/// Errors in the library.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuestError {
    /// A configuration that cannot produce a consistent model.
    ///
    /// Raised at construction time, e.g., when freezing a backbone with
    /// non-standard input channels or removing more layers than exist.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An input whose shape does not match the configured model.
    #[error("Shape mismatch in {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Name of the checked input.
        what: String,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// A batch without an input required by the configured model.
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// Record key error.
    #[error("Record key error: {0}")]
    RecordKey(String),

    /// Record value type error.
    #[error("Record value type error: {0}")]
    RecordValueType(String),
}

impl QuestError {
    /// Shorthand for [`QuestError::Configuration`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Shorthand for [`QuestError::ShapeMismatch`].
    pub fn shape(what: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
