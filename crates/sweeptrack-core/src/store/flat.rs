//! Flat-text backend: `params`, `runlog` and `results` files in one directory.
//!
//! Result lines look like
//! `param_id|name value-name value|job_id|result_set|measure value|...`.
//! Every line is parsed independently; a bad line is logged and skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use tracing::{info, warn};

use crate::errors::{SweepError, SweepResult};
use crate::models::{parse_measure, ParamValue, ParameterSet, ResultRecord, SubmissionRecord};
use crate::store::ResultStream;

pub const PARAMS_FILE: &str = "params";
pub const RESULTS_FILE: &str = "results";
pub const RUNLOG_FILE: &str = "runlog";

static PAIR_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s=]+").unwrap());

/// Parsing switches for legacy result files.
#[derive(Clone, Debug, Default)]
pub struct FlatOptions {
    /// Names assigned positionally to measures written without a name.
    pub measure_names: Option<Vec<String>>,
    /// Rewrite `@` to `_at_` in measure names.
    pub safe_measure_names: bool,
}

pub struct FlatSource {
    root: PathBuf,
    options: FlatOptions,
}

impl FlatSource {
    pub fn new(root: impl Into<PathBuf>, options: FlatOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parameter ids are the 1-based line numbers of the `params` file.
    pub fn list_parameter_ids(&self) -> SweepResult<Vec<u32>> {
        Ok(self
            .parameter_sets()?
            .into_iter()
            .map(|p| p.id)
            .collect())
    }

    pub fn parameter_sets(&self) -> SweepResult<Vec<ParameterSet>> {
        let path = self.root.join(PARAMS_FILE);
        let lines = read_lines(&path).map_err(|e| {
            SweepError::Configuration(format!(
                "cannot read parameter registry {}: {e}",
                path.display()
            ))
        })?;
        // Ids are positional, so an undecodable line still takes its slot.
        let sets: Vec<ParameterSet> = lines
            .iter()
            .enumerate()
            .map(|(i, bytes)| {
                ParameterSet::from_dash_pairs(i as u32 + 1, &String::from_utf8_lossy(bytes))
            })
            .collect();
        info!(
            "Read {} which contained {} sets of parameters",
            path.display(),
            sets.len()
        );
        Ok(sets)
    }

    pub fn load_submission_log(&self) -> SweepResult<Vec<SubmissionRecord>> {
        let path = self.root.join(RUNLOG_FILE);
        if !path.is_file() {
            warn!("no runlog found at {}", path.display());
            return Ok(vec![]);
        }
        let mut runlog = Vec::new();
        for (i, bytes) in read_lines(&path)?.iter().enumerate() {
            let parsed = decode_line(bytes, i + 1).and_then(|line| {
                if line.trim().is_empty() {
                    return Ok(None);
                }
                parse_runlog_line(line, i + 1).map(Some)
            });
            match parsed {
                Ok(None) => {}
                Ok(Some(record)) => runlog.push(record),
                Err(e) => warn!("skipping runlog line in {}: {e}", path.display()),
            }
        }
        info!(
            "Read {} which contained data on {} runs",
            path.display(),
            runlog.len()
        );
        Ok(runlog)
    }

    pub fn stream_results(&self) -> SweepResult<ResultStream> {
        let path = self.root.join(RESULTS_FILE);
        if !path.is_file() {
            warn!("no results file found at {}", path.display());
            return Ok(ResultStream::default());
        }
        let mut stream = ResultStream::default();
        for (i, bytes) in read_lines(&path)?.iter().enumerate() {
            let parsed = decode_line(bytes, i + 1).and_then(|line| {
                if line.trim().is_empty() {
                    return Ok(None);
                }
                parse_result_line(line, i + 1, &self.options).map(Some)
            });
            match parsed {
                Ok(None) => {}
                Ok(Some(record)) => stream.records.push(record),
                Err(e) => {
                    warn!("skipping result line in {}: {e}", path.display());
                    stream.skipped_lines += 1;
                }
            }
        }
        info!(
            "Read {} which contained {} results",
            path.display(),
            stream.records.len()
        );
        Ok(stream)
    }
}

/// Raw lines of a file, without their `\n` or `\r\n` terminators.
fn read_lines(path: &Path) -> std::io::Result<Vec<Vec<u8>>> {
    let reader = BufReader::new(File::open(path)?);
    reader
        .split(b'\n')
        .map(|line| {
            let mut bytes = line?;
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
            Ok(bytes)
        })
        .collect()
}

fn decode_line(bytes: &[u8], line_no: usize) -> SweepResult<&str> {
    std::str::from_utf8(bytes).map_err(|_| SweepError::format(line_no, "invalid UTF-8"))
}

/// Parse one `param_id|job_id|submit_dir` runlog line.
pub fn parse_runlog_line(line: &str, line_no: usize) -> SweepResult<SubmissionRecord> {
    let parts: Vec<&str> = line.trim_end().split('|').collect();
    if parts.len() < 2 {
        return Err(SweepError::format(line_no, "expected param_id|job_id|submit_dir"));
    }
    let param_id = parse_param_id(parts[0], line_no)?;
    Ok(SubmissionRecord {
        param_id,
        job_id: parts[1].trim().to_string(),
        submit_dir: parts.get(2).map(|s| s.trim().to_string()).unwrap_or_default(),
    })
}

/// Parse one result line into a record.
pub fn parse_result_line(
    line: &str,
    line_no: usize,
    options: &FlatOptions,
) -> SweepResult<ResultRecord> {
    let parts: Vec<&str> = line.trim_end().split('|').collect();
    let param_id = parse_param_id(parts[0], line_no)?;
    if parts.len() < 4 {
        return Err(SweepError::format(
            line_no,
            format!("expected at least 4 fields, found {}", parts.len()),
        ));
    }

    let mut params = IndexMap::new();
    for piece in split_param_field(parts[1]) {
        let tokens: Vec<&str> = PAIR_SPLIT_RE.split(piece).filter(|t| !t.is_empty()).collect();
        match tokens.as_slice() {
            [name] => {
                params.insert(name.to_string(), None);
            }
            [name, value] => {
                params.insert(name.to_string(), Some(ParamValue::coerce(value)));
            }
            _ => {
                return Err(SweepError::format(
                    line_no,
                    format!("cannot split parameter '{piece}' into name and value"),
                ))
            }
        }
    }

    let mut measures = IndexMap::new();
    let mut positional = 0usize;
    for part in &parts[4..] {
        let tokens: Vec<&str> = part.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if tokens.len() == 1 {
            let names = options.measure_names.as_ref().ok_or_else(|| {
                SweepError::format(
                    line_no,
                    format!("measure '{}' has no name and no measure names were given", tokens[0]),
                )
            })?;
            let name = names.get(positional).ok_or_else(|| {
                SweepError::format(
                    line_no,
                    format!("more unnamed measures than the {} names given", names.len()),
                )
            })?;
            positional += 1;
            insert_measure(&mut measures, name, tokens[0], line_no, options)?;
            continue;
        }
        if tokens.len() % 2 != 0 {
            return Err(SweepError::format(
                line_no,
                format!("measure field '{part}' is not a list of name value pairs"),
            ));
        }
        for pair in tokens.chunks(2) {
            insert_measure(&mut measures, pair[0], pair[1], line_no, options)?;
        }
    }

    Ok(ResultRecord {
        param_id,
        job_id: parts[2].trim().to_string(),
        result_set: parts[3].trim().to_string(),
        measures,
        params,
    })
}

fn insert_measure(
    measures: &mut IndexMap<String, f64>,
    name: &str,
    raw: &str,
    line_no: usize,
    options: &FlatOptions,
) -> SweepResult<()> {
    let value = parse_measure(raw).ok_or_else(|| {
        SweepError::format(line_no, format!("measure {name} has non-numeric value '{raw}'"))
    })?;
    let name = if options.safe_measure_names {
        name.replace('@', "_at_")
    } else {
        name.to_string()
    };
    measures.insert(name, value);
    Ok(())
}

fn parse_param_id(field: &str, line_no: usize) -> SweepResult<u32> {
    let field = field.trim();
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SweepError::format(
            line_no,
            format!("parameter id '{field}' is not numeric"),
        ));
    }
    field
        .parse::<u32>()
        .map_err(|e| SweepError::format(line_no, format!("parameter id '{field}': {e}")))
}

/// Split the dash-joined parameter field. A dash only separates pairs when a
/// name follows it, so exponents like `1e-05` stay intact.
fn split_param_field(field: &str) -> Vec<&str> {
    let bytes = field.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        let next_is_name = bytes
            .get(i + 1)
            .is_some_and(|n| n.is_ascii_alphabetic() || *n == b'_');
        if b == b'-' && next_is_name {
            pieces.push(&field[start..i]);
            start = i + 1;
        }
    }
    pieces.push(&field[start..]);
    pieces
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}
