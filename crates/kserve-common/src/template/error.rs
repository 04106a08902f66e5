//! Template error types

use thiserror::Error;

/// Errors that can occur during template operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// Template text could not be parsed
    #[error("template: {template}:{line}: {message}")]
    Parse {
        /// Template name
        template: String,
        /// 1-based line of the offending action
        line: usize,
        /// What went wrong
        message: String,
    },

    /// Template parsed but could not be evaluated against the data
    #[error("template: {template}: executing at <{action}>: {message}")]
    Exec {
        /// Template name
        template: String,
        /// Source text of the failing action
        action: String,
        /// What went wrong
        message: String,
    },
}

impl TemplateError {
    /// Whether this is a parse (syntax) error
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }
}
