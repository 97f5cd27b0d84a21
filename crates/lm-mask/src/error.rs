//! Error types for the masking engine.

use thiserror::Error;

/// Result type for masking operations.
pub type Result<T> = std::result::Result<T, MaskingError>;

/// Errors that can occur while configuring or running the masking engine.
///
/// Configuration-time variants are fatal to construction. Per-record
/// variants are contained by the engine and never escape `process()`.
#[derive(Error, Debug)]
pub enum MaskingError {
    /// The masking configuration is invalid as a whole.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A regex pattern failed syntax or safety validation.
    #[error("pattern validation failed for '{pattern}': {reason}")]
    PatternValidation { pattern: String, reason: String },

    /// Rate limiter bounds or a rate-limit key are invalid.
    #[error("invalid rate limit configuration: {0}")]
    InvalidRateLimitConfiguration(String),

    /// A conditional rule could not be evaluated.
    #[error("rule '{rule}' failed: {reason}")]
    RuleExecution { rule: String, reason: String },

    /// A single value could not be masked (unstringifiable, unencodable,
    /// or over the regex input bound).
    #[error("masking operation failed: {reason}")]
    MaskingOperationFailed { reason: String },

    /// The caller's audit callback failed.
    #[error("audit logging failed: {0}")]
    AuditLogging(String),

    /// JSON parsing or encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MaskingError {
    /// Shorthand for a per-value masking failure.
    pub fn operation_failed(reason: impl Into<String>) -> Self {
        MaskingError::MaskingOperationFailed {
            reason: reason.into(),
        }
    }

    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            MaskingError::Configuration(_) => 10,
            MaskingError::PatternValidation { .. } => 11,
            MaskingError::InvalidRateLimitConfiguration(_) => 12,
            MaskingError::RuleExecution { .. } => 20,
            MaskingError::MaskingOperationFailed { .. } => 21,
            MaskingError::AuditLogging(_) => 22,
            MaskingError::Json(_) => 23,
        }
    }

    /// Whether the error is raised at construction time and must be fixed
    /// in the configuration.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            MaskingError::Configuration(_)
                | MaskingError::PatternValidation { .. }
                | MaskingError::InvalidRateLimitConfiguration(_)
        )
    }
}
