//! Storage backends that normalize sweep telemetry into the record model.

pub mod database;
pub mod directory;
pub mod flat;
pub mod schema;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{SweepError, SweepResult};
use crate::models::{ParameterSet, ResultRecord, SubmissionRecord};

use database::RelationalSource;
use directory::DirectorySource;
use flat::{FlatOptions, FlatSource};

const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

/// What a backend knows about a run's result artifacts beyond the records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFileState {
    /// The run directory holds no result files at all.
    Missing,
    /// At least one result file exists but is zero bytes.
    Empty,
}

/// Records produced by one backend, plus per-id artifact observations.
#[derive(Clone, Debug, Default)]
pub struct ResultStream {
    pub records: Vec<ResultRecord>,
    pub file_states: BTreeMap<u32, ResultFileState>,
    pub skipped_lines: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Auto,
    Flat,
    Directory,
    Relational,
}

/// The three storage layouts behind one interface.
pub enum ResultSource {
    Flat(FlatSource),
    Directory(DirectorySource),
    Relational(RelationalSource),
}

impl ResultSource {
    /// Open `path` with the given backend, sniffing the layout for `Auto`.
    pub fn open(path: &Path, kind: BackendKind, flat_options: FlatOptions) -> SweepResult<Self> {
        if !path.exists() {
            return Err(SweepError::Configuration(format!(
                "input {} doesn't exist",
                path.display()
            )));
        }
        let kind = match kind {
            BackendKind::Auto => detect_backend(path)?,
            other => other,
        };
        debug!("opening {} with the {kind:?} backend", path.display());
        Ok(match kind {
            BackendKind::Flat => ResultSource::Flat(FlatSource::new(path, flat_options)),
            BackendKind::Directory => ResultSource::Directory(DirectorySource::new(path)?),
            BackendKind::Relational | BackendKind::Auto => {
                ResultSource::Relational(RelationalSource::open(path)?)
            }
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            ResultSource::Flat(_) => BackendKind::Flat,
            ResultSource::Directory(_) => BackendKind::Directory,
            ResultSource::Relational(_) => BackendKind::Relational,
        }
    }

    pub fn list_parameter_ids(&self) -> SweepResult<Vec<u32>> {
        match self {
            ResultSource::Flat(s) => s.list_parameter_ids(),
            ResultSource::Directory(s) => s.list_parameter_ids(),
            ResultSource::Relational(s) => s.list_parameter_ids(),
        }
    }

    pub fn stream_results(&self) -> SweepResult<ResultStream> {
        match self {
            ResultSource::Flat(s) => s.stream_results(),
            ResultSource::Directory(s) => s.stream_results(),
            ResultSource::Relational(s) => s.stream_results(),
        }
    }

    pub fn load_submission_log(&self) -> SweepResult<Vec<SubmissionRecord>> {
        match self {
            ResultSource::Flat(s) => s.load_submission_log(),
            ResultSource::Directory(s) => s.load_submission_log(),
            ResultSource::Relational(s) => s.load_submission_log(),
        }
    }

    pub fn parameter_set(&self, param_id: u32) -> SweepResult<Option<ParameterSet>> {
        match self {
            ResultSource::Relational(s) => s.parameter_set(param_id),
            ResultSource::Flat(s) => Ok(s.parameter_sets()?.into_iter().find(|p| p.id == param_id)),
            ResultSource::Directory(s) => {
                Ok(s.parameter_sets()?.into_iter().find(|p| p.id == param_id))
            }
        }
    }
}

/// SQLite file -> relational, directory with a `results` file -> flat,
/// any other directory -> per-directory.
pub fn detect_backend(path: &Path) -> SweepResult<BackendKind> {
    if path.is_file() {
        let mut header = [0u8; 16];
        let mut file = std::fs::File::open(path)?;
        let read = file.read(&mut header)?;
        if read == SQLITE_MAGIC.len() && header == SQLITE_MAGIC {
            return Ok(BackendKind::Relational);
        }
        return Err(SweepError::Configuration(format!(
            "{} is neither a directory nor a SQLite database",
            path.display()
        )));
    }
    if path.join(flat::RESULTS_FILE).is_file() || path.join(flat::PARAMS_FILE).is_file() {
        return Ok(BackendKind::Flat);
    }
    Ok(BackendKind::Directory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_each_layout() {
        let dir = tempfile::tempdir().unwrap();

        let flat_root = dir.path().join("flat");
        std::fs::create_dir_all(&flat_root).unwrap();
        std::fs::write(flat_root.join("params"), "-dim 10\n").unwrap();
        assert_eq!(detect_backend(&flat_root).unwrap(), BackendKind::Flat);

        let dir_root = dir.path().join("runs");
        std::fs::create_dir_all(dir_root.join("1")).unwrap();
        assert_eq!(detect_backend(&dir_root).unwrap(), BackendKind::Directory);

        let db = dir.path().join("sweep.db");
        rusqlite::Connection::open(&db)
            .unwrap()
            .execute_batch("CREATE TABLE params (dim INTEGER);")
            .unwrap();
        assert_eq!(detect_backend(&db).unwrap(), BackendKind::Relational);

        let junk = dir.path().join("notes.txt");
        std::fs::write(&junk, "hello").unwrap();
        assert!(detect_backend(&junk).unwrap_err().is_fatal());
    }

    #[test]
    fn open_rejects_missing_input() {
        let err = ResultSource::open(
            Path::new("/no/such/sweep"),
            BackendKind::Auto,
            FlatOptions::default(),
        )
        .err()
        .unwrap();
        assert!(err.is_fatal());
    }
}
