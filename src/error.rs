use thiserror::Error;

/// Errors raised by model construction, configuration and training.
///
/// Functions return [`anyhow::Result`]; these variants can be recovered with
/// [`anyhow::Error::downcast_ref`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// A configuration value is missing, out of range or inconsistent.
    #[error("invalid config value for {key:?}: {reason}")]
    InvalidConfig {
        /// The offending key.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
    /// The activation name did not resolve.
    #[error("couldn't interpret activation {0:?}")]
    UnknownActivation(String),
    /// The corruption class did not resolve.
    #[error("unknown corruption class {0:?}")]
    UnknownCorruptor(String),
    /// The cost class did not resolve.
    #[error("unknown cost class {0:?}")]
    UnknownCost(String),
    /// An input or parameter has the wrong shape.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        found: Vec<usize>,
    },
    /// An update for this parameter was already recorded.
    #[error("duplicate update for parameter {0:?}")]
    DuplicateUpdate(String),
    /// Exact partition function requested for too many hidden units.
    #[error("exact log Z needs 2^{nhid} terms, at most 2^{max} supported")]
    PartitionTooLarge {
        /// Hidden units of the model.
        nhid: usize,
        /// Largest supported hidden layer.
        max: usize,
    },
}

impl Error {
    pub(crate) fn invalid_config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
