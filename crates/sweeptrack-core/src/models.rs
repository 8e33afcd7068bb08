//! Shared typed models used across the adapters, the reconciler and ranking.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Job ids with this prefix were run locally and never reached the scheduler.
pub const DEFAULT_SENTINEL_PREFIX: &str = "SERIAL";

/// Measure name written by the evaluator as a sample count, not a score.
pub const COUNT_MARKER_MEASURE: &str = "N";

/// Exception raised by the trainer when the loss diverges.
pub const NAN_EXCEPTION_SIGNATURE: &str = "fasttext::DenseMatrix::EncounteredNaNError";

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A scalar hyperparameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Coerce a raw token: integer first, then float, else the text itself.
    pub fn coerce(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(v) = raw.parse::<i64>() {
            return ParamValue::Int(v);
        }
        match raw.parse::<f64>() {
            Ok(v) => ParamValue::Float(v),
            Err(_) => ParamValue::Text(raw.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Text(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => f.write_str(v),
        }
    }
}

/// Parse a measure token as a number. Measures are always numeric.
pub fn parse_measure(raw: &str) -> Option<f64> {
    match ParamValue::coerce(raw) {
        ParamValue::Text(_) => None,
        other => other.as_f64(),
    }
}

/// Strip the array-task suffix from a scheduler job id (`850049_1` -> `850049`).
pub fn base_job_id(job_id: &str) -> &str {
    job_id.split('_').next().unwrap_or(job_id)
}

// ---------------------------------------------------------------------------
// 1. ParameterSet
// ---------------------------------------------------------------------------

/// One point of the hyperparameter search space.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ParameterSet {
    pub id: u32,
    pub values: IndexMap<String, Option<ParamValue>>,
}

/// `-name` with an identifier-like name, otherwise `None`.
fn flag_name(token: &str) -> Option<&str> {
    let name = token.strip_prefix('-')?;
    let first = name.chars().next()?;
    (first.is_alphabetic() || first == '_').then_some(name)
}

impl ParameterSet {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            values: IndexMap::new(),
        }
    }

    /// Parse whitespace-separated `-name value` pairs. A name followed by
    /// another name, or by nothing, is a flag with an absent value.
    /// Negative numbers such as `-0.5` are values, not names.
    pub fn from_dash_pairs(id: u32, text: &str) -> Self {
        let mut values = IndexMap::new();
        let mut pending: Option<&str> = None;
        for token in text.split_whitespace() {
            if let Some(name) = flag_name(token) {
                if let Some(flag) = pending.replace(name) {
                    values.insert(flag.to_string(), None);
                }
                continue;
            }
            match pending.take() {
                Some(name) => {
                    values.insert(name.to_string(), Some(ParamValue::coerce(token)));
                }
                None => pending = Some(token),
            }
        }
        if let Some(flag) = pending {
            values.insert(flag.to_string(), None);
        }
        Self { id, values }
    }

    /// Render as command-line arguments for the training script.
    pub fn to_cli_args(&self) -> String {
        self.values
            .iter()
            .map(|(name, value)| match value {
                Some(v) => format!("-{name} {v}"),
                None => format!("-{name}"),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ---------------------------------------------------------------------------
// 2. SubmissionRecord
// ---------------------------------------------------------------------------

/// One line of the append-only submission log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubmissionRecord {
    pub param_id: u32,
    pub job_id: String,
    pub submit_dir: String,
}

impl SubmissionRecord {
    pub fn base_job_id(&self) -> &str {
        base_job_id(&self.job_id)
    }
}

// ---------------------------------------------------------------------------
// 3. ResultRecord
// ---------------------------------------------------------------------------

/// One evaluation of one parameter set on one result-set.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ResultRecord {
    pub param_id: u32,
    pub job_id: String,
    pub result_set: String,
    pub measures: IndexMap<String, f64>,
    pub params: IndexMap<String, Option<ParamValue>>,
}

impl ResultRecord {
    pub fn measure(&self, name: &str) -> Option<f64> {
        self.measures.get(name).copied().filter(|v| !v.is_nan())
    }
}

// ---------------------------------------------------------------------------
// 4. CompletionStatus
// ---------------------------------------------------------------------------

/// Derived outcome of one parameter id. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CompletionStatus {
    Complete,
    Partial,
    NoSubmission,
    NoResultFiles,
    EmptyResultFile,
    NanFailure,
    SchedulerError(String),
    UnknownFailure,
}

impl CompletionStatus {
    /// Phrase used when grouping ids by status in reports.
    pub fn describe(&self) -> String {
        match self {
            CompletionStatus::Complete => "complete results".to_string(),
            CompletionStatus::Partial => "missing some result-sets".to_string(),
            CompletionStatus::NoSubmission => {
                "no submission (probably not submitted yet)".to_string()
            }
            CompletionStatus::NoResultFiles => "no results files".to_string(),
            CompletionStatus::EmptyResultFile => "empty results files".to_string(),
            CompletionStatus::NanFailure => "NaN errors".to_string(),
            CompletionStatus::SchedulerError(state) => format!("{state} scheduler status"),
            CompletionStatus::UnknownFailure => "unknown errors".to_string(),
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStatus::Complete => f.write_str("complete"),
            CompletionStatus::Partial => f.write_str("partial"),
            CompletionStatus::NoSubmission => f.write_str("no_submission"),
            CompletionStatus::NoResultFiles => f.write_str("no_result_files"),
            CompletionStatus::EmptyResultFile => f.write_str("empty_result_file"),
            CompletionStatus::NanFailure => f.write_str("nan_failure"),
            CompletionStatus::SchedulerError(state) => write!(f, "scheduler_error({state})"),
            CompletionStatus::UnknownFailure => f.write_str("unknown_failure"),
        }
    }
}
