//! Batched scheduler accounting queries and their summaries.
//!
//! One query covers every base job id of a pass. Accounting rows come back
//! as `JobID|State|ElapsedRaw|MaxRSS`, one row for the allocation and one
//! per step (`850049_1.batch`, `850049_1.0`); steps fold into their job.

use std::collections::{BTreeMap, BTreeSet};
use std::process::Command;

use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{SweepError, SweepResult};

/// Terminal state of a job that finished normally.
pub const COMPLETED_STATE: &str = "COMPLETED";

const KIB: f64 = 1024.0;

/// Something that answers one batched accounting query.
pub trait SchedulerBackend {
    /// Raw `|`-separated accounting rows for the given base job ids.
    fn query(&self, base_job_ids: &[String]) -> SweepResult<String>;
}

/// Slurm accounting through the `sacct` command.
pub struct Sacct {
    program: String,
}

impl Sacct {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Sacct {
    fn default() -> Self {
        Self::new("sacct")
    }
}

impl SchedulerBackend for Sacct {
    fn query(&self, base_job_ids: &[String]) -> SweepResult<String> {
        let output = Command::new(&self.program)
            .args(["-P", "-n", "-a", "--format", "JobID,State,ElapsedRaw,MaxRSS", "-j"])
            .arg(base_job_ids.join(","))
            .output()
            .map_err(|e| SweepError::Scheduler(format!("failed to run {}: {e}", self.program)))?;
        if !output.status.success() {
            return Err(SweepError::Scheduler(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Largest elapsed time and memory seen across one job's steps.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobSummary {
    pub state: String,
    pub elapsed_secs: u64,
    pub max_rss_bytes: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SchedulerSummary {
    /// Keyed by job id with step suffixes removed (`850049_1`).
    pub jobs: BTreeMap<String, JobSummary>,
    pub max_elapsed_secs: u64,
    pub max_rss_bytes: f64,
}

impl SchedulerSummary {
    /// Jobs whose terminal state is not a clean completion.
    pub fn error_states(&self) -> BTreeMap<String, String> {
        self.jobs
            .iter()
            .filter(|(_, job)| job.state != COMPLETED_STATE)
            .map(|(id, job)| (id.clone(), job.state.clone()))
            .collect()
    }

    pub fn elapsed_times(&self) -> Vec<u64> {
        self.jobs.values().map(|j| j.elapsed_secs).collect()
    }

    pub fn mean_elapsed_secs(&self) -> Option<f64> {
        if self.jobs.is_empty() {
            return None;
        }
        let total: u64 = self.jobs.values().map(|j| j.elapsed_secs).sum();
        Some(total as f64 / self.jobs.len() as f64)
    }
}

/// Base ids to query: array suffixes stripped, sentinel ids dropped.
pub fn query_batch<'a>(
    job_ids: impl IntoIterator<Item = &'a str>,
    sentinel_prefix: &str,
) -> Vec<String> {
    job_ids
        .into_iter()
        .filter(|id| !id.is_empty())
        .filter(|id| sentinel_prefix.is_empty() || !id.starts_with(sentinel_prefix))
        .map(|id| crate::models::base_job_id(id).to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Issue one query and fold the rows. An empty batch never calls out.
pub fn load_scheduler_data(
    backend: &dyn SchedulerBackend,
    base_job_ids: &[String],
) -> SweepResult<SchedulerSummary> {
    if base_job_ids.is_empty() {
        return Ok(SchedulerSummary::default());
    }
    debug!("querying scheduler for {} jobs", base_job_ids.len());
    let output = backend.query(base_job_ids)?;
    Ok(parse_accounting(&output))
}

/// Fold accounting rows into per-job maxima. Malformed rows are skipped.
pub fn parse_accounting(output: &str) -> SchedulerSummary {
    let mut summary = SchedulerSummary::default();
    for (i, line) in output.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 4 {
            warn!("skipping accounting row {}: expected 4 fields", i + 1);
            continue;
        }
        let job_id = parts[0].split('.').next().unwrap_or(parts[0]).to_string();
        let elapsed = match parts[2].trim() {
            "" => 0,
            raw => raw.parse::<u64>().unwrap_or_else(|_| {
                warn!("accounting row {}: bad elapsed time '{raw}'", i + 1);
                0
            }),
        };
        let rss = parse_mem(parts[3]).unwrap_or_else(|e| {
            warn!("accounting row {}: {e}", i + 1);
            0.0
        });

        summary
            .jobs
            .entry(job_id)
            .and_modify(|job| {
                job.elapsed_secs = job.elapsed_secs.max(elapsed);
                job.max_rss_bytes = job.max_rss_bytes.max(rss);
            })
            .or_insert_with(|| JobSummary {
                state: parts[1].trim().to_string(),
                elapsed_secs: elapsed,
                max_rss_bytes: rss,
            });
        summary.max_elapsed_secs = summary.max_elapsed_secs.max(elapsed);
        summary.max_rss_bytes = summary.max_rss_bytes.max(rss);
    }
    summary
}

/// Memory in bytes from a plain byte count or a `K`/`M`/`G` suffixed value.
pub fn parse_mem(raw: &str) -> SweepResult<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0.0);
    }
    let bad = || SweepError::format(0, format!("unrecognised memory value '{raw}'"));
    if let Ok(v) = raw.parse::<f64>() {
        return Ok(v);
    }
    let unit_at = raw.char_indices().last().map(|(i, _)| i).unwrap_or(0);
    let (number, unit) = raw.split_at(unit_at);
    let scale = match unit {
        "K" => KIB,
        "M" => KIB * KIB,
        "G" => KIB * KIB * KIB,
        "T" => KIB * KIB * KIB * KIB,
        _ => return Err(bad()),
    };
    number.parse::<f64>().map(|v| v * scale).map_err(|_| bad())
}

/// Bytes with a binary unit, four significant digits.
pub fn format_mem(bytes: f64) -> String {
    let mut value = bytes;
    for unit in ["", "K", "M", "G"] {
        if value < KIB {
            return format!("{} {unit}", significant(value, 4));
        }
        value /= KIB;
    }
    format!("{} T", significant(value, 4))
}

fn significant(value: f64, digits: i32) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = (digits - 1 - magnitude).max(0) as usize;
    let text = format!("{value:.decimals$}");
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

/// `H:MM:SS`, prefixed with whole days when longer than one.
pub fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let days = total / 86_400;
    let rest = total % 86_400;
    let clock = format!("{}:{:02}:{:02}", rest / 3600, (rest % 3600) / 60, rest % 60);
    match days {
        0 => clock,
        1 => format!("1 day, {clock}"),
        d => format!("{d} days, {clock}"),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistogramBin {
    pub start_secs: u64,
    pub end_secs: u64,
    pub count: usize,
    pub fraction: f64,
    pub cumulative: f64,
}

/// Fixed-width bins from zero; the last bin stretches to `max_secs` and
/// includes it.
pub fn elapsed_histogram(times: &[u64], bin_secs: u64, max_secs: u64) -> Vec<HistogramBin> {
    if times.is_empty() || bin_secs == 0 {
        return vec![];
    }
    let mut edges: Vec<u64> = (0..max_secs).step_by(bin_secs as usize).collect();
    match edges.len() {
        0 | 1 => edges = vec![0, max_secs.max(1)],
        _ => {
            if let Some(last) = edges.last_mut() {
                *last = max_secs;
            }
        }
    }

    let total = times.len() as f64;
    let mut cumulative = 0usize;
    let last_bin = edges.len() - 2;
    (0..=last_bin)
        .map(|b| {
            let (lo, hi) = (edges[b], edges[b + 1]);
            let count = times
                .iter()
                .filter(|&&t| t >= lo && (t < hi || (b == last_bin && t <= hi)))
                .count();
            cumulative += count;
            HistogramBin {
                start_secs: lo,
                end_secs: hi,
                count,
                fraction: count as f64 / total,
                cumulative: cumulative as f64 / total,
            }
        })
        .collect()
}
