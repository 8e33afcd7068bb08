//! Join of the parameter registry, submission log and result stream into one
//! completion status per parameter id.
//!
//! The expected result-set universe is the set of result-set names seen
//! anywhere in the stream. An id is complete when its own result-set names
//! equal that universe with no duplicates.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::{debug, warn};

use crate::diagnostics::classifier::{FailureCause, LogVerdict};
use crate::models::{CompletionStatus, ResultRecord, SubmissionRecord};
use crate::store::{ResultFileState, ResultStream};

/// Immutable inputs of one reconciliation pass.
#[derive(Clone, Debug, Default)]
pub struct SweepSnapshot {
    pub param_ids: Vec<u32>,
    pub submissions: Vec<SubmissionRecord>,
    pub results: ResultStream,
}

/// Diagnosis gathered for ids without results.
#[derive(Clone, Debug, Default)]
pub struct FailureEvidence {
    /// Log verdict per parameter id.
    pub log_verdicts: HashMap<u32, LogVerdict>,
    /// Non-successful terminal state per job id (`850049_1`).
    pub scheduler_errors: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParamStatus {
    pub param_id: u32,
    pub status: CompletionStatus,
    pub missing_result_sets: Vec<String>,
    /// Most recent submission, used for log lookup.
    pub submission: Option<SubmissionRecord>,
    pub scheduler_state: Option<String>,
    pub failure_detail: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// More than one submission for one id; the last one is used.
    AmbiguousRetries { param_id: u32, job_ids: Vec<String> },
    /// Duplicate result-set names for one id.
    WrongResultCount { param_id: u32, found: usize, expected: usize },
    /// A log matched a generic failure rule.
    UnexpectedException { param_id: u32, exception: String },
    /// Results for an id outside the registry.
    UnregisteredId { param_id: u32 },
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Reconciliation {
    pub universe: BTreeSet<String>,
    pub statuses: Vec<ParamStatus>,
    pub anomalies: Vec<Anomaly>,
    pub empty_result_files: BTreeSet<u32>,
}

impl Reconciliation {
    pub fn status_of(&self, param_id: u32) -> Option<&ParamStatus> {
        self.statuses
            .binary_search_by_key(&param_id, |s| s.param_id)
            .ok()
            .map(|i| &self.statuses[i])
    }

    pub fn ids_with(&self, status: &CompletionStatus) -> Vec<u32> {
        self.statuses
            .iter()
            .filter(|s| &s.status == status)
            .map(|s| s.param_id)
            .collect()
    }

    pub fn complete_ids(&self) -> BTreeSet<u32> {
        self.ids_with(&CompletionStatus::Complete).into_iter().collect()
    }

    pub fn counts(&self) -> BTreeMap<CompletionStatus, usize> {
        let mut counts = BTreeMap::new();
        for s in &self.statuses {
            *counts.entry(s.status.clone()).or_insert(0) += 1;
        }
        counts
    }
}

pub fn expected_universe(records: &[ResultRecord]) -> BTreeSet<String> {
    records.iter().map(|r| r.result_set.clone()).collect()
}

fn submissions_by_id(submissions: &[SubmissionRecord]) -> HashMap<u32, Vec<&SubmissionRecord>> {
    let mut by_id: HashMap<u32, Vec<&SubmissionRecord>> = HashMap::new();
    for s in submissions {
        by_id.entry(s.param_id).or_default().push(s);
    }
    by_id
}

/// Ids with no results but at least one submission, paired with their most
/// recent submission. These are the ids whose logs are worth scanning.
/// An empty result stream needs no diagnosis.
pub fn pending_diagnoses(snapshot: &SweepSnapshot) -> Vec<(u32, SubmissionRecord)> {
    if snapshot.results.records.is_empty() {
        return vec![];
    }
    let with_results: BTreeSet<u32> = snapshot.results.records.iter().map(|r| r.param_id).collect();
    let by_id = submissions_by_id(&snapshot.submissions);
    snapshot
        .param_ids
        .iter()
        .filter(|id| !with_results.contains(*id))
        .filter_map(|id| {
            by_id
                .get(id)
                .and_then(|subs| subs.last())
                .map(|latest| (*id, (*latest).clone()))
        })
        .collect()
}

/// Assign exactly one status to every registered id.
pub fn reconcile(snapshot: &SweepSnapshot, evidence: &FailureEvidence) -> Reconciliation {
    let records = &snapshot.results.records;
    let universe = expected_universe(records);
    let by_id = submissions_by_id(&snapshot.submissions);

    let mut results_by_id: HashMap<u32, Vec<&ResultRecord>> = HashMap::new();
    for r in records {
        results_by_id.entry(r.param_id).or_default().push(r);
    }

    let mut out = Reconciliation {
        universe: universe.clone(),
        empty_result_files: snapshot
            .results
            .file_states
            .iter()
            .filter(|(_, state)| **state == ResultFileState::Empty)
            .map(|(id, _)| *id)
            .collect(),
        ..Default::default()
    };

    let mut param_ids = snapshot.param_ids.clone();
    param_ids.sort_unstable();
    param_ids.dedup();

    let registered: BTreeSet<u32> = param_ids.iter().copied().collect();
    let mut unregistered: Vec<u32> = results_by_id
        .keys()
        .filter(|id| !registered.contains(*id))
        .copied()
        .collect();
    unregistered.sort_unstable();
    for param_id in unregistered {
        warn!("results found for paramset {param_id} which is not in the registry");
        out.anomalies.push(Anomaly::UnregisteredId { param_id });
    }

    for &id in &param_ids {
        let subs = by_id.get(&id).map(Vec::as_slice).unwrap_or(&[]);
        if subs.len() > 1 {
            let job_ids: Vec<String> = subs.iter().map(|s| s.job_id.clone()).collect();
            warn!("paramset {id} has more than one run: {}", job_ids.join(", "));
            out.anomalies.push(Anomaly::AmbiguousRetries {
                param_id: id,
                job_ids,
            });
        }
        let latest = subs.last().map(|s| (*s).clone());
        let results = results_by_id.get(&id).map(Vec::as_slice).unwrap_or(&[]);

        let status = if results.is_empty() {
            classify_without_results(id, latest, snapshot, evidence, &mut out.anomalies)
        } else {
            classify_with_results(id, latest, results, &universe, evidence, &mut out.anomalies)
        };
        debug!("paramset {id}: {}", status.status);
        out.statuses.push(status);
    }
    out
}

fn classify_without_results(
    id: u32,
    latest: Option<SubmissionRecord>,
    snapshot: &SweepSnapshot,
    evidence: &FailureEvidence,
    anomalies: &mut Vec<Anomaly>,
) -> ParamStatus {
    let Some(latest) = latest else {
        return ParamStatus {
            param_id: id,
            status: CompletionStatus::NoSubmission,
            missing_result_sets: vec![],
            submission: None,
            scheduler_state: None,
            failure_detail: None,
        };
    };

    // Without any results there is no universe to diagnose against.
    if snapshot.results.records.is_empty() {
        let status = match snapshot.results.file_states.get(&id) {
            Some(ResultFileState::Empty) => CompletionStatus::EmptyResultFile,
            _ => CompletionStatus::NoResultFiles,
        };
        return ParamStatus {
            param_id: id,
            status,
            missing_result_sets: vec![],
            submission: Some(latest),
            scheduler_state: None,
            failure_detail: None,
        };
    }

    let verdict = evidence.log_verdicts.get(&id);
    let scheduler_state = evidence.scheduler_errors.get(&latest.job_id).cloned();
    let matched = match verdict {
        Some(LogVerdict::Matched(m)) => Some(m),
        _ => None,
    };

    let status = match (matched, &scheduler_state) {
        (Some(m), _) if m.cause == FailureCause::NanFailure => CompletionStatus::NanFailure,
        (_, Some(state)) => CompletionStatus::SchedulerError(state.clone()),
        (Some(_), None) => CompletionStatus::UnknownFailure,
        (None, None) => match snapshot.results.file_states.get(&id) {
            Some(ResultFileState::Empty) => CompletionStatus::EmptyResultFile,
            Some(ResultFileState::Missing) => CompletionStatus::NoResultFiles,
            None => CompletionStatus::UnknownFailure,
        },
    };

    if let Some(m) = matched.filter(|m| m.cause != FailureCause::NanFailure) {
        warn!("paramset {id}: unknown error {} in job {}", m.detail, latest.job_id);
        anomalies.push(Anomaly::UnexpectedException {
            param_id: id,
            exception: m.detail.clone(),
        });
    }

    ParamStatus {
        param_id: id,
        status,
        missing_result_sets: vec![],
        failure_detail: matched.map(|m| m.detail.clone()),
        scheduler_state,
        submission: Some(latest),
    }
}

fn classify_with_results(
    id: u32,
    latest: Option<SubmissionRecord>,
    results: &[&ResultRecord],
    universe: &BTreeSet<String>,
    evidence: &FailureEvidence,
    anomalies: &mut Vec<Anomaly>,
) -> ParamStatus {
    let names: BTreeSet<&str> = results.iter().map(|r| r.result_set.as_str()).collect();
    let missing: Vec<String> = universe
        .iter()
        .filter(|u| !names.contains(u.as_str()))
        .cloned()
        .collect();
    let duplicated = results.len() != names.len();

    if duplicated {
        warn!(
            "paramset {id} has wrong number of results: {} (expected {})",
            results.len(),
            universe.len()
        );
        anomalies.push(Anomaly::WrongResultCount {
            param_id: id,
            found: results.len(),
            expected: universe.len(),
        });
    }

    let scheduler_state = results
        .iter()
        .map(|r| r.job_id.as_str())
        .chain(latest.iter().map(|s| s.job_id.as_str()))
        .find_map(|job| evidence.scheduler_errors.get(job).cloned());

    let status = if missing.is_empty() && !duplicated {
        CompletionStatus::Complete
    } else {
        if !missing.is_empty() {
            warn!("paramset {id} is missing some results: {}", missing.join(","));
        }
        CompletionStatus::Partial
    };

    ParamStatus {
        param_id: id,
        status,
        missing_result_sets: missing,
        submission: latest,
        scheduler_state,
        failure_detail: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::classifier::FailureMatch;

    fn result(id: u32, set: &str) -> ResultRecord {
        ResultRecord {
            param_id: id,
            job_id: format!("700_{id}"),
            result_set: set.to_string(),
            ..Default::default()
        }
    }

    fn submission(id: u32, job: &str) -> SubmissionRecord {
        SubmissionRecord {
            param_id: id,
            job_id: job.to_string(),
            submit_dir: "/sweep".to_string(),
        }
    }

    fn scenario() -> SweepSnapshot {
        SweepSnapshot {
            param_ids: vec![1, 2, 3],
            submissions: vec![submission(1, "700_1"), submission(2, "700_2")],
            results: ResultStream {
                records: vec![result(1, "A"), result(1, "B"), result(2, "A")],
                ..Default::default()
            },
        }
    }

    #[test]
    fn three_id_scenario() {
        let rec = reconcile(&scenario(), &FailureEvidence::default());
        assert_eq!(rec.universe, BTreeSet::from(["A".to_string(), "B".to_string()]));
        assert_eq!(rec.status_of(1).unwrap().status, CompletionStatus::Complete);
        let two = rec.status_of(2).unwrap();
        assert_eq!(two.status, CompletionStatus::Partial);
        assert_eq!(two.missing_result_sets, vec!["B".to_string()]);
        assert_eq!(rec.status_of(3).unwrap().status, CompletionStatus::NoSubmission);
    }

    #[test]
    fn every_registered_id_gets_exactly_one_status() {
        let mut snap = scenario();
        snap.param_ids = (1..=50).rev().collect();
        let rec = reconcile(&snap, &FailureEvidence::default());
        let ids: Vec<u32> = rec.statuses.iter().map(|s| s.param_id).collect();
        assert_eq!(ids, (1..=50).collect::<Vec<_>>());
    }

    #[test]
    fn complete_iff_universe_matches_without_duplicates() {
        let sets = ["dev", "test", "wiki"];
        let records: Vec<ResultRecord> = (1..=4)
            .flat_map(|id| sets.iter().map(move |s| result(id, s)))
            .collect();
        let snap = SweepSnapshot {
            param_ids: vec![1, 2, 3, 4],
            submissions: vec![],
            results: ResultStream {
                records,
                ..Default::default()
            },
        };
        let rec = reconcile(&snap, &FailureEvidence::default());
        assert_eq!(rec.complete_ids().len(), 4);

        let mut dup = snap.clone();
        dup.results.records.push(result(2, "dev"));
        let rec = reconcile(&dup, &FailureEvidence::default());
        assert_eq!(rec.status_of(2).unwrap().status, CompletionStatus::Partial);
        assert!(rec.status_of(2).unwrap().missing_result_sets.is_empty());
        assert!(rec.anomalies.contains(&Anomaly::WrongResultCount {
            param_id: 2,
            found: 4,
            expected: 3
        }));
    }

    #[test]
    fn nan_log_reclassifies_failed_run() {
        let mut snap = scenario();
        snap.results.records.retain(|r| r.param_id != 2);
        let plain = reconcile(&snap, &FailureEvidence::default());
        assert_eq!(plain.status_of(2).unwrap().status, CompletionStatus::UnknownFailure);

        let mut evidence = FailureEvidence::default();
        evidence.log_verdicts.insert(
            2,
            LogVerdict::Matched(FailureMatch {
                cause: FailureCause::NanFailure,
                line_number: 9,
                detail: "fasttext::DenseMatrix::EncounteredNaNError".into(),
            }),
        );
        let rec = reconcile(&snap, &evidence);
        assert_eq!(rec.status_of(2).unwrap().status, CompletionStatus::NanFailure);
    }

    #[test]
    fn scheduler_state_applies_when_log_is_not_conclusive() {
        let mut snap = scenario();
        snap.results.records.retain(|r| r.param_id != 2);
        let mut evidence = FailureEvidence::default();
        evidence
            .scheduler_errors
            .insert("700_2".to_string(), "OUT_OF_MEMORY".to_string());
        evidence.log_verdicts.insert(2, LogVerdict::Clean);
        let rec = reconcile(&snap, &evidence);
        assert_eq!(
            rec.status_of(2).unwrap().status,
            CompletionStatus::SchedulerError("OUT_OF_MEMORY".into())
        );
    }

    #[test]
    fn most_recent_submission_is_authoritative() {
        let mut snap = scenario();
        snap.results.records.retain(|r| r.param_id == 1);
        snap.submissions.push(submission(2, "800_2"));
        let pending = pending_diagnoses(&snap);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.job_id, "800_2");

        let rec = reconcile(&snap, &FailureEvidence::default());
        assert_eq!(rec.status_of(2).unwrap().submission.as_ref().unwrap().job_id, "800_2");
        assert!(rec
            .anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::AmbiguousRetries { param_id: 2, .. })));
    }

    #[test]
    fn empty_stream_falls_back_to_submission_log() {
        let mut snap = scenario();
        snap.results.records.clear();
        let rec = reconcile(&snap, &FailureEvidence::default());
        assert!(rec.universe.is_empty());
        assert_eq!(rec.status_of(1).unwrap().status, CompletionStatus::NoResultFiles);
        assert_eq!(rec.status_of(2).unwrap().status, CompletionStatus::NoResultFiles);
        assert_eq!(rec.status_of(3).unwrap().status, CompletionStatus::NoSubmission);
        assert!(pending_diagnoses(&snap).is_empty());

        // Log evidence is not consulted without a universe.
        let mut evidence = FailureEvidence::default();
        evidence.log_verdicts.insert(
            1,
            LogVerdict::Matched(FailureMatch {
                cause: FailureCause::NanFailure,
                line_number: 1,
                detail: "fasttext::DenseMatrix::EncounteredNaNError".into(),
            }),
        );
        let rec = reconcile(&snap, &evidence);
        assert_eq!(rec.status_of(1).unwrap().status, CompletionStatus::NoResultFiles);
    }

    #[test]
    fn directory_file_states_refine_failures() {
        let mut snap = scenario();
        snap.results.records.retain(|r| r.param_id == 1);
        snap.submissions.push(submission(3, "700_3"));
        snap.results.file_states.insert(2, ResultFileState::Empty);
        snap.results.file_states.insert(3, ResultFileState::Missing);
        let rec = reconcile(&snap, &FailureEvidence::default());
        assert_eq!(rec.status_of(2).unwrap().status, CompletionStatus::EmptyResultFile);
        assert_eq!(rec.status_of(3).unwrap().status, CompletionStatus::NoResultFiles);
        assert_eq!(rec.empty_result_files, BTreeSet::from([2]));
    }

    #[test]
    fn unregistered_results_are_flagged() {
        let mut snap = scenario();
        snap.results.records.push(result(9, "A"));
        let rec = reconcile(&snap, &FailureEvidence::default());
        assert!(rec.anomalies.contains(&Anomaly::UnregisteredId { param_id: 9 }));
        assert!(rec.status_of(9).is_none());
    }
}
