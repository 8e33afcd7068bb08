//! Failure classification by scanning scheduler log artifacts.
//!
//! Rules are tried in order against each line; the first line matching any
//! rule decides the verdict and the scan stops.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::errors::SweepResult;
use crate::models::NAN_EXCEPTION_SIGNATURE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    NanFailure,
    UnknownFailure,
}

pub struct FailureRule {
    pub pattern: Regex,
    pub cause: FailureCause,
}

impl FailureRule {
    pub fn new(pattern: &str, cause: FailureCause) -> SweepResult<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            cause,
        })
    }
}

/// A rule hit: which cause, where, and the first capture group if any.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailureMatch {
    pub cause: FailureCause,
    pub line_number: usize,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum LogVerdict {
    /// No log artifact exists at any candidate path.
    Missing,
    /// The artifact exists and no rule matched.
    Clean,
    Matched(FailureMatch),
}

impl LogVerdict {
    pub fn cause(&self) -> Option<FailureCause> {
        match self {
            LogVerdict::Matched(m) => Some(m.cause),
            _ => None,
        }
    }
}

pub struct FailureClassifier {
    rules: Vec<FailureRule>,
}

impl FailureClassifier {
    pub fn new(rules: Vec<FailureRule>) -> Self {
        Self { rules }
    }

    /// The trainer's NaN abort, then any other uncaught C++ exception.
    pub fn with_default_rules() -> SweepResult<Self> {
        Ok(Self::new(vec![
            FailureRule::new(
                &format!(
                    "terminate called after throwing an instance of '({})'",
                    regex::escape(NAN_EXCEPTION_SIGNATURE)
                ),
                FailureCause::NanFailure,
            )?,
            FailureRule::new(
                "terminate called after throwing an instance of '(.*)'",
                FailureCause::UnknownFailure,
            )?,
        ]))
    }

    pub fn rules(&self) -> &[FailureRule] {
        &self.rules
    }

    /// Scan in-memory log text.
    pub fn scan_text(&self, text: &str) -> Option<FailureMatch> {
        text.lines()
            .enumerate()
            .find_map(|(i, line)| self.match_line(line, i + 1))
    }

    fn match_line(&self, line: &str, line_number: usize) -> Option<FailureMatch> {
        self.rules.iter().find_map(|rule| {
            rule.pattern.captures(line).map(|caps| FailureMatch {
                cause: rule.cause,
                line_number,
                detail: caps
                    .get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
            })
        })
    }

    /// Scan the first existing candidate log for `job_id` under `log_dir`.
    /// A missing log is expected and only logged.
    pub fn classify(&self, log_dir: &Path, job_id: &str) -> LogVerdict {
        let Some(path) = log_artifact_candidates(log_dir, job_id)
            .into_iter()
            .find(|p| p.is_file())
        else {
            warn!(
                "could not find log file {} (check the log directory, or skip log analysis)",
                log_dir.join(format!("slurm-{job_id}.out")).display()
            );
            return LogVerdict::Missing;
        };
        match self.scan_file(&path) {
            Ok(Some(m)) => LogVerdict::Matched(m),
            Ok(None) => LogVerdict::Clean,
            Err(e) => {
                warn!("cannot read log file {}: {e}", path.display());
                LogVerdict::Missing
            }
        }
    }

    fn scan_file(&self, path: &Path) -> std::io::Result<Option<FailureMatch>> {
        let reader = BufReader::new(File::open(path)?);
        for (i, line) in reader.split(b'\n').enumerate() {
            let bytes = line?;
            let line = String::from_utf8_lossy(&bytes);
            if let Some(m) = self.match_line(&line, i + 1) {
                return Ok(Some(m));
            }
        }
        Ok(None)
    }
}

/// `slurm-<job>.out`, then `<job>.out`.
pub fn log_artifact_candidates(log_dir: &Path, job_id: &str) -> Vec<PathBuf> {
    vec![
        log_dir.join(format!("slurm-{job_id}.out")),
        log_dir.join(format!("{job_id}.out")),
    ]
}
