// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every stage of the pipeline.
// Stage-local failures are converted into counted outcomes by the stage that
// hits them; only configuration, I/O and queue exhaustion surface to callers.
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// 4.1 Pipeline Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Backpressure: stage '{stage}' stayed full for {waited_ms}ms")]
    Backpressure { stage: &'static str, waited_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl PipelineError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            PipelineError::Config(_) => false,
            PipelineError::Correlation(e) => e.is_recoverable(),
            PipelineError::Plan(_) => true,
            PipelineError::Backpressure { .. } => true,
            PipelineError::Io(_) => true,
            PipelineError::Internal(_) => false,
            PipelineError::ShuttingDown => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Correlation(_) => "correlation",
            PipelineError::Plan(_) => "plan",
            PipelineError::Backpressure { .. } => "backpressure",
            PipelineError::Io(_) => "io",
            PipelineError::Internal(_) => "internal",
            PipelineError::ShuttingDown => "shutdown",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            PipelineError::Config(_) => RecoveryHint::FixConfiguration,
            PipelineError::Correlation(e) => e.recovery_hint(),
            PipelineError::Plan(_) => RecoveryHint::Skip,
            PipelineError::Backpressure { .. } => RecoveryHint::RetryWithBackoff,
            PipelineError::ShuttingDown => RecoveryHint::None,
            PipelineError::Io(_) => RecoveryHint::RetryWithBackoff,
            PipelineError::Internal(_) => RecoveryHint::AlertOperator,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Correlation Errors
// ----------------------------------------------------------------------------

/// Errors from the correlator's admission path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// The entity key cannot be routed to a window. Discarded, counted, never retried.
    #[error("Unroutable record '{raw_key}': {reason}")]
    Unroutable { raw_key: String, reason: &'static str },

    /// The record's bucket closed too long ago to be re-opened.
    #[error("Late record for '{key}' dropped ({late_by_ms}ms past allowed lateness)")]
    TooLate { key: String, late_by_ms: u64 },
}

impl CorrelationError {
    pub fn is_recoverable(&self) -> bool {
        false
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        RecoveryHint::Skip
    }

    /// Metric label for the drop reason
    pub fn reason(&self) -> &'static str {
        match self {
            CorrelationError::Unroutable { .. } => "unroutable",
            CorrelationError::TooLate { .. } => "late",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Plan Errors
// ----------------------------------------------------------------------------

/// Plan parse failures. Never fatal: the record proceeds with `db.plan.unparsed`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Invalid plan JSON: {0}")]
    InvalidJson(String),

    #[error("Unexpected plan shape: {0}")]
    UnexpectedShape(&'static str),

    #[error("Empty plan payload")]
    Empty,

    #[error("No operators found in text plan")]
    NoOperators,
}

impl PlanError {
    /// Short code written to `db.plan.parse_error`
    pub fn code(&self) -> &'static str {
        match self {
            PlanError::InvalidJson(_) => "invalid_json",
            PlanError::UnexpectedShape(_) => "unexpected_shape",
            PlanError::Empty => "empty",
            PlanError::NoOperators => "no_operators",
        }
    }
}

impl From<serde_json::Error> for PlanError {
    fn from(e: serde_json::Error) -> Self {
        PlanError::InvalidJson(e.to_string())
    }
}

// ----------------------------------------------------------------------------
// 4.5 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Result type for plan parsing
pub type PlanResult<T> = Result<T, PlanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err: PipelineError = ConfigError::invalid_value("correlator.bucket_width", "must be > 0").into();
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::FixConfiguration);

        let err = PipelineError::Backpressure { stage: "correlator", waited_ms: 50 };
        assert!(err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::RetryWithBackoff);
    }

    #[test]
    fn test_unroutable_is_skipped() {
        let err: PipelineError = CorrelationError::Unroutable {
            raw_key: "db1".into(),
            reason: "missing separator",
        }
        .into();
        assert_eq!(err.category(), "correlation");
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::Skip);
        assert!(err.to_string().contains("missing separator"));
    }

    #[test]
    fn test_plan_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: PlanError = json_err.into();
        assert_eq!(err.code(), "invalid_json");
    }
}
