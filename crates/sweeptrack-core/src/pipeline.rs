//! One reconciliation pass: load, query the scheduler, scan logs, reconcile.
//!
//! Log scanning for ids without results runs on a dedicated Rayon pool.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::SweepConfig;
use crate::diagnostics::classifier::{FailureClassifier, LogVerdict};
use crate::diagnostics::scheduler::{
    load_scheduler_data, query_batch, SchedulerBackend, SchedulerSummary,
};
use crate::errors::{SweepError, SweepResult};
use crate::models::{ResultRecord, SubmissionRecord};
use crate::query::reconcile::{
    pending_diagnoses, reconcile, FailureEvidence, Reconciliation, SweepSnapshot,
};
use crate::store::ResultSource;

/// Everything a status report or ranking needs from one pass.
pub struct Analysis {
    pub snapshot: SweepSnapshot,
    pub evidence: FailureEvidence,
    /// `None` when the scheduler was skipped or could not be reached.
    pub scheduler: Option<SchedulerSummary>,
    pub reconciliation: Reconciliation,
    pub elapsed_ms: u128,
}

impl Analysis {
    pub fn records(&self) -> &[ResultRecord] {
        &self.snapshot.results.records
    }

    /// Records of paramsets that have every result set. Rankings are built
    /// from these only.
    pub fn complete_records(&self) -> Vec<ResultRecord> {
        let complete = self.reconciliation.complete_ids();
        self.records()
            .iter()
            .filter(|r| complete.contains(&r.param_id))
            .cloned()
            .collect()
    }
}

/// Keep a fatal error, otherwise warn and fall back to an empty value.
fn or_empty<T: Default>(what: &str, loaded: SweepResult<T>) -> SweepResult<T> {
    match loaded {
        Ok(value) => Ok(value),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!("cannot read {what}, treating it as empty: {e}");
            Ok(T::default())
        }
    }
}

/// Read the registry, the submission log and every result from `source`.
/// Only configuration errors abort; anything else leaves that input empty.
pub fn load_snapshot(source: &ResultSource) -> SweepResult<SweepSnapshot> {
    let param_ids = or_empty("parameter registry", source.list_parameter_ids())?;
    let submissions = or_empty("submission log", source.load_submission_log())?;
    let results = or_empty("results", source.stream_results())?;
    info!(
        "loaded {} paramsets, {} submissions, {} results",
        param_ids.len(),
        submissions.len(),
        results.records.len()
    );
    if results.skipped_lines > 0 {
        warn!("skipped {} malformed result lines", results.skipped_lines);
    }
    for (set, count) in result_set_counts(&results.records) {
        info!("found {count} results for {set}");
    }
    Ok(SweepSnapshot {
        param_ids,
        submissions,
        results,
    })
}

pub fn result_set_counts(records: &[ResultRecord]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for r in records {
        *counts.entry(r.result_set.clone()).or_insert(0) += 1;
    }
    counts
}

/// Base job ids from both the submission log and the result records.
pub fn scheduler_batch(snapshot: &SweepSnapshot, sentinel_prefix: &str) -> Vec<String> {
    let job_ids = snapshot
        .submissions
        .iter()
        .map(|s| s.job_id.as_str())
        .chain(snapshot.results.records.iter().map(|r| r.job_id.as_str()));
    query_batch(job_ids, sentinel_prefix)
}

/// Scan the log of each pending submission. Falls back to a sequential scan
/// if the pool cannot be built.
pub fn classify_logs(
    classifier: &FailureClassifier,
    log_dir: &Path,
    pending: &[(u32, SubmissionRecord)],
    workers: usize,
) -> HashMap<u32, LogVerdict> {
    if pending.is_empty() {
        return HashMap::new();
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build();

    let scan =
        |(id, sub): &(u32, SubmissionRecord)| (*id, classifier.classify(log_dir, &sub.job_id));
    match pool {
        Ok(pool) => pool.install(|| pending.par_iter().map(scan).collect()),
        Err(e) => {
            warn!("cannot build log scanning pool ({e}); scanning sequentially");
            pending.iter().map(scan).collect()
        }
    }
}

/// Run a full pass over `config.input`. Only configuration problems are
/// returned as errors; scheduler and log failures degrade to warnings.
pub fn analyze(config: &SweepConfig, scheduler: &dyn SchedulerBackend) -> SweepResult<Analysis> {
    let start = Instant::now();
    config.validate()?;
    let input = config
        .input
        .as_deref()
        .ok_or_else(|| SweepError::Configuration("no input location given".into()))?;
    let source = ResultSource::open(input, config.backend, config.flat_options())?;
    let snapshot = load_snapshot(&source)?;

    let mut evidence = FailureEvidence::default();
    let mut summary = None;
    if !config.skip_scheduler {
        let batch = scheduler_batch(&snapshot, &config.sentinel_prefix);
        match load_scheduler_data(scheduler, &batch) {
            Ok(s) => {
                evidence.scheduler_errors = s.error_states();
                summary = Some(s);
            }
            Err(e) => warn!("scheduler data unavailable, continuing without it: {e}"),
        }
    }

    if !config.skip_logs {
        let pending = pending_diagnoses(&snapshot);
        if !pending.is_empty() {
            let classifier = FailureClassifier::with_default_rules()?;
            let log_dir = config.effective_log_dir();
            info!("scanning {} logs in {}", pending.len(), log_dir.display());
            evidence.log_verdicts = classify_logs(&classifier, &log_dir, &pending, config.workers);
        }
    }

    let reconciliation = reconcile(&snapshot, &evidence);
    for (status, count) in reconciliation.counts() {
        debug!("{count} paramsets {status}");
    }
    Ok(Analysis {
        snapshot,
        evidence,
        scheduler: summary,
        reconciliation,
        elapsed_ms: start.elapsed().as_millis(),
    })
}
