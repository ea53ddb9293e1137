use chrono::NaiveDate;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure categories of the data-preparation pipeline.
///
/// The first three are scoped to one instrument and are aggregated into the
/// pipeline report; `LeakageViolation` means a temporal invariant was broken
/// and nothing downstream can be trusted.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{instrument}: insufficient history ({rows} rows, need {required})")]
    InsufficientHistory {
        instrument: String,
        rows: usize,
        required: usize,
    },

    #[error("{instrument}: malformed input: {reason}")]
    MalformedInput { instrument: String, reason: String },

    #[error("{instrument}: feature `{feature}` is infinite on {date}")]
    NumericalDegeneracy {
        instrument: String,
        feature: &'static str,
        date: NaiveDate,
    },

    #[error("temporal leakage: {0}")]
    LeakageViolation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("evaluation: {0}")]
    Evaluation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn malformed(instrument: &str, reason: impl Into<String>) -> Self {
        PipelineError::MalformedInput {
            instrument: instrument.to_string(),
            reason: reason.into(),
        }
    }

    /// Structural defects are the ones strict mode escalates: malformed input,
    /// numerical degeneracy and leakage violations. Short history is always
    /// just a skip.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            PipelineError::MalformedInput { .. }
                | PipelineError::NumericalDegeneracy { .. }
                | PipelineError::LeakageViolation(_)
        )
    }
}
