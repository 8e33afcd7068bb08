//! Per-directory backend: one numerically named directory per parameter id.
//!
//! ```text
//! <root>/17/params            -dim 100 -lr 0.25
//! <root>/17/results.dev       P@1 0.61\nN 5000
//! <root>/17/slurm_id_850049   (marker, empty)
//! ```

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::{SweepError, SweepResult};
use crate::models::{
    parse_measure, ParameterSet, ResultRecord, SubmissionRecord, COUNT_MARKER_MEASURE,
};
use crate::store::{ResultFileState, ResultStream};

pub const PARAMS_FILE: &str = "params";
pub const RESULTS_PREFIX: &str = "results.";
pub const JOB_MARKER_PREFIX: &str = "slurm_id_";

/// Array indices wrap at this size when recovered from the directory name.
const ARRAY_INDEX_MODULUS: u32 = 1000;

pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> SweepResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SweepError::Configuration(format!(
                "directory {} doesn't exist",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Numerically named subdirectories, ascending.
    pub fn list_parameter_ids(&self) -> SweepResult<Vec<u32>> {
        Ok(self.run_dirs().into_iter().map(|(id, _)| id).collect())
    }

    pub fn parameter_sets(&self) -> SweepResult<Vec<ParameterSet>> {
        Ok(self
            .run_dirs()
            .into_iter()
            .map(|(id, dir)| read_params(id, &dir))
            .collect())
    }

    /// One submission per `slurm_id_*` marker, ordered so that the
    /// lexicographically greatest marker comes last.
    pub fn load_submission_log(&self) -> SweepResult<Vec<SubmissionRecord>> {
        let mut runlog = Vec::new();
        for (id, dir) in self.run_dirs() {
            for job_id in job_markers(&dir) {
                runlog.push(SubmissionRecord {
                    param_id: id,
                    job_id: with_array_index(&job_id, id),
                    submit_dir: dir.to_string_lossy().into_owned(),
                });
            }
        }
        if runlog.is_empty() {
            warn!("no {JOB_MARKER_PREFIX}* markers found under {}", self.root.display());
        }
        Ok(runlog)
    }

    pub fn stream_results(&self) -> SweepResult<ResultStream> {
        let mut stream = ResultStream::default();
        let dirs = self.run_dirs();
        let dir_count = dirs.len();
        for (id, dir) in dirs {
            let job_id = job_markers(&dir)
                .last()
                .map(|j| with_array_index(j, id))
                .unwrap_or_default();
            let params = read_params(id, &dir).values;

            let files = result_files(&dir);
            if files.is_empty() {
                debug!("paramset {id} has no results files");
                stream.file_states.insert(id, ResultFileState::Missing);
                continue;
            }
            for (result_set, path) in files {
                let content = match std::fs::read_to_string(&path) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("cannot read {}: {e}", path.display());
                        stream.skipped_lines += 1;
                        continue;
                    }
                };
                if content.is_empty() {
                    stream.file_states.insert(id, ResultFileState::Empty);
                    continue;
                }
                match parse_result_file(&content) {
                    Ok(measures) => stream.records.push(ResultRecord {
                        param_id: id,
                        job_id: job_id.clone(),
                        result_set,
                        measures,
                        params: params.clone(),
                    }),
                    Err(e) => {
                        warn!("skipping {}: {e}", path.display());
                        stream.skipped_lines += 1;
                    }
                }
            }
        }
        info!(
            "Read {} run directories under {} with {} results",
            dir_count,
            self.root.display(),
            stream.records.len()
        );
        Ok(stream)
    }

    fn run_dirs(&self) -> Vec<(u32, PathBuf)> {
        let mut dirs: Vec<(u32, PathBuf)> = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                name.parse::<u32>().ok().map(|id| (id, e.into_path()))
            })
            .collect();
        dirs.sort_by_key(|(id, _)| *id);
        dirs
    }
}

fn read_params(id: u32, dir: &Path) -> ParameterSet {
    let path = dir.join(PARAMS_FILE);
    match std::fs::read_to_string(&path) {
        Ok(text) => ParameterSet::from_dash_pairs(id, &text),
        Err(e) => {
            warn!("cannot read {}: {e}", path.display());
            ParameterSet::new(id)
        }
    }
}

fn files_in(dir: &Path) -> Vec<(String, PathBuf)> {
    let mut files: Vec<(String, PathBuf)> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| (e.file_name().to_string_lossy().into_owned(), e.into_path()))
        .collect();
    files.sort();
    files
}

/// `(result_set, path)` for every `results.<set>` file.
fn result_files(dir: &Path) -> Vec<(String, PathBuf)> {
    files_in(dir)
        .into_iter()
        .filter_map(|(name, path)| {
            name.strip_prefix(RESULTS_PREFIX)
                .filter(|set| !set.is_empty())
                .map(|set| (set.to_string(), path))
        })
        .collect()
}

/// Job ids recovered from marker file names, sorted ascending.
fn job_markers(dir: &Path) -> Vec<String> {
    files_in(dir)
        .into_iter()
        .filter_map(|(name, _)| name.strip_prefix(JOB_MARKER_PREFIX).map(str::to_string))
        .filter(|id| !id.is_empty())
        .collect()
}

/// Append the array index derived from the directory id when missing.
pub fn with_array_index(job_id: &str, param_id: u32) -> String {
    if job_id.contains('_') {
        job_id.to_string()
    } else {
        format!("{job_id}_{}", param_id % ARRAY_INDEX_MODULUS)
    }
}

/// Parse newline-separated `name value` pairs, dropping the count marker.
pub fn parse_result_file(content: &str) -> SweepResult<IndexMap<String, f64>> {
    let mut measures = IndexMap::new();
    for (i, line) in content.lines().enumerate() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [] => continue,
            [name, _] if *name == COUNT_MARKER_MEASURE => continue,
            [name, raw] => {
                let value = parse_measure(raw).ok_or_else(|| {
                    SweepError::format(i + 1, format!("measure {name} has non-numeric value '{raw}'"))
                })?;
                measures.insert(name.to_string(), value);
            }
            _ => {
                return Err(SweepError::format(
                    i + 1,
                    format!("expected 'name value', found '{}'", line.trim()),
                ))
            }
        }
    }
    Ok(measures)
}
