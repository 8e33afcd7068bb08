//! Error types for the sweeptrack core library.

/// Top-level error enum for the sweeptrack core library.
///
/// Only [`SweepError::Configuration`] aborts a reconciliation pass; every
/// other variant is local to one record, one file or one external call and
/// is degraded by the caller into a warning or a completion status.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Format error at line {line}: {message}")]
    Format { line: usize, message: String },

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Scoring error: {0}")]
    Scoring(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

impl SweepError {
    pub fn format(line: usize, message: impl Into<String>) -> Self {
        SweepError::Format {
            line,
            message: message.into(),
        }
    }

    /// Whether the error should abort the whole pass.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SweepError::Configuration(_))
    }
}

pub type SweepResult<T> = Result<T, SweepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configuration_errors_are_fatal() {
        assert!(SweepError::Configuration("missing input".into()).is_fatal());
        assert!(!SweepError::format(3, "bad id").is_fatal());
        assert!(!SweepError::Scheduler("sacct not found".into()).is_fatal());
        assert!(!SweepError::Scoring("min".into()).is_fatal());
    }

    #[test]
    fn format_error_names_the_line() {
        let err = SweepError::format(12, "first field is not numeric");
        assert_eq!(
            err.to_string(),
            "Format error at line 12: first field is not numeric"
        );
    }
}
