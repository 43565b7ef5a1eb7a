//! API rewriter errors

use thiserror::Error;

/// Errors raised while reading or editing a raw JSON document.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The value at a path exists but has an incompatible type,
    /// or the document is not valid JSON.
    #[error("Malformed input at '{path}': {reason}")]
    MalformedInput {
        /// Dotted path that was being addressed
        path: String,
        /// What was wrong with the value
        reason: String,
    },

    /// An embedded value could not be decoded or encoded (e.g. base64 patch)
    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl TransformError {
    pub(crate) fn malformed(path: &str, reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while loading or validating a rule set.
#[derive(Debug, Error)]
pub enum RulesError {
    /// Rule file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Rule file is not valid YAML/JSON for the rule schema
    #[error("Parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Two rules map to the same name, so the mapping is not reversible
    #[error("Mapping is not bijective: {0}")]
    NotBijective(String),

    /// A rule is internally inconsistent (empty name, mismatched key, ...)
    #[error("Invalid rule: {0}")]
    Invalid(String),
}

/// Errors raised by the rewriter engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RewriteError {
    /// Underlying document edit failed
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),
}
