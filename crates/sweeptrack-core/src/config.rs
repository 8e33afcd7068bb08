//! Pass configuration: JSON file, then environment, then command line.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{SweepError, SweepResult};
use crate::models::DEFAULT_SENTINEL_PREFIX;
use crate::store::flat::FlatOptions;
use crate::store::BackendKind;

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_HISTOGRAM_BIN_MINUTES: u64 = 10;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    /// Flat-text directory, run-directory root or SQLite database.
    pub input: Option<PathBuf>,
    pub backend: BackendKind,
    /// Where `slurm-<job>.out` logs live. Defaults to the input directory.
    pub log_dir: Option<PathBuf>,
    pub skip_logs: bool,
    pub skip_scheduler: bool,
    pub measure_names: Option<Vec<String>>,
    pub safe_measure_names: bool,
    pub verbose: bool,
    pub workers: usize,
    pub sentinel_prefix: String,
    pub scheduler_program: String,
    pub histogram_bin_minutes: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            input: None,
            backend: BackendKind::Auto,
            log_dir: None,
            skip_logs: false,
            skip_scheduler: false,
            measure_names: None,
            safe_measure_names: false,
            verbose: false,
            workers: DEFAULT_WORKERS,
            sentinel_prefix: DEFAULT_SENTINEL_PREFIX.to_string(),
            scheduler_program: "sacct".to_string(),
            histogram_bin_minutes: DEFAULT_HISTOGRAM_BIN_MINUTES,
        }
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

impl SweepConfig {
    /// Read a JSON config file. Unknown keys are rejected; missing keys
    /// take their defaults.
    pub fn load(path: &Path) -> SweepResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SweepError::Configuration(format!("cannot read config {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            SweepError::Configuration(format!("invalid config {}: {e}", path.display()))
        })
    }

    /// Apply `SWEEPTRACK_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("SWEEPTRACK_LOG_DIR").filter(|d| !d.trim().is_empty()) {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = lookup("SWEEPTRACK_SKIP_LOGS") {
            self.skip_logs = is_truthy(&v);
        }
        if let Some(v) = lookup("SWEEPTRACK_SKIP_SCHEDULER") {
            self.skip_scheduler = is_truthy(&v);
        }
        if let Some(v) = lookup("SWEEPTRACK_WORKERS") {
            match v.trim().parse::<usize>() {
                Ok(n) => self.workers = n,
                Err(_) => warn!("ignoring SWEEPTRACK_WORKERS={v:?}: not a number"),
            }
        }
    }

    pub fn validate(&self) -> SweepResult<()> {
        let Some(input) = &self.input else {
            return Err(SweepError::Configuration("no input location given".into()));
        };
        if !input.exists() {
            return Err(SweepError::Configuration(format!(
                "input {} doesn't exist",
                input.display()
            )));
        }
        if self.workers == 0 {
            return Err(SweepError::Configuration(
                "worker count must be at least 1".into(),
            ));
        }
        if self.histogram_bin_minutes == 0 {
            return Err(SweepError::Configuration(
                "histogram bin width must be at least 1 minute".into(),
            ));
        }
        Ok(())
    }

    /// The configured log directory, else the input itself when it is a
    /// directory, else the input's parent.
    pub fn effective_log_dir(&self) -> PathBuf {
        if let Some(dir) = &self.log_dir {
            return dir.clone();
        }
        match &self.input {
            Some(input) if input.is_dir() => input.clone(),
            Some(input) => input
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            None => PathBuf::from("."),
        }
    }

    pub fn flat_options(&self) -> FlatOptions {
        FlatOptions {
            measure_names: self.measure_names.clone(),
            safe_measure_names: self.safe_measure_names,
        }
    }
}
