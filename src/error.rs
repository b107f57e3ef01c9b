use thiserror::Error;

/// Failures surfaced by the decision core. Each public entry point returns one of
/// these instead of letting a single bad pair or a failed call stop a cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("insufficient data for {pair}: {reason}")]
    InsufficientData { pair: String, reason: String },
    #[error("series mismatch for {pair}: {detail}")]
    SeriesMismatch { pair: String, detail: String },
    #[error("non-finite {what} for {pair}")]
    NonFinite { pair: String, what: String },
    #[error("source error: {0}")]
    Source(String),
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },
    #[error("execution error: {0}")]
    Execution(String),
    #[error("not eligible: {0}")]
    NotEligible(String),
}

impl EngineError {
    pub fn insufficient(pair: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InsufficientData {
            pair: pair.into(),
            reason: reason.into(),
        }
    }

    pub fn mismatch(pair: impl Into<String>, detail: impl Into<String>) -> Self {
        EngineError::SeriesMismatch {
            pair: pair.into(),
            detail: detail.into(),
        }
    }

    /// Data problems exclude one pair; everything else points at a collaborator.
    pub fn is_data_problem(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientData { .. }
                | EngineError::SeriesMismatch { .. }
                | EngineError::NonFinite { .. }
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
