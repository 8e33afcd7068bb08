//! Grouped, human-readable warnings over a reconciliation.
//!
//! By default each group prints as a count and percentage. Verbose output
//! lists the affected ids in blocks of 1000, relative to the block offset,
//! with consecutive ids collapsed to `start-end`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::models::CompletionStatus;
use crate::query::reconcile::{Anomaly, Reconciliation};

const OFFSET_BLOCK: u32 = 1000;

/// Collapse sorted ids into `a-b` ranges: `[1,2,3,5]` -> `1-3,5`.
pub fn indices_to_str(ids: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut start = 0;
    for i in 1..=ids.len() {
        if i == ids.len() || ids[i] != ids[i - 1] + 1 {
            if start < i - 1 {
                parts.push(format!("{}-{}", ids[start], ids[i - 1]));
            } else {
                parts.push(ids[i - 1].to_string());
            }
            start = i;
        }
    }
    parts.join(",")
}

/// Split ids into `(offset, ids relative to offset)` blocks. Ids are
/// 1-based, so block `k` holds `k*1000+1 ..= (k+1)*1000`.
pub fn offset_blocks(ids: &[u32]) -> Vec<(u32, Vec<u32>)> {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut blocks: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for id in sorted {
        let offset = id.saturating_sub(1) / OFFSET_BLOCK * OFFSET_BLOCK;
        blocks.entry(offset).or_default().push(id - offset);
    }
    blocks.into_iter().collect()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WarningGroup {
    pub message: String,
    pub ids: Vec<u32>,
}

impl WarningGroup {
    pub fn render(&self, total: usize, verbose: bool) -> String {
        let n = self.ids.len();
        let pct = if total == 0 {
            0.0
        } else {
            n as f64 / total as f64 * 100.0
        };
        if !verbose {
            return format!(
                "WARNING: {n}/{total} = {pct:.2}% runs had {}. (Try --verbose.)",
                self.message
            );
        }
        let mut out = format!(
            "WARNING: the following param indices had {}, {n}/{total} = {pct:.2}%:",
            self.message
        );
        for (offset, relative) in offset_blocks(&self.ids) {
            let _ = write!(out, "\n[OFFSET: {offset}] {}", indices_to_str(&relative));
        }
        out
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatusReport {
    pub total: usize,
    pub incomplete: usize,
    pub groups: Vec<WarningGroup>,
    pub anomalies: Vec<String>,
}

impl StatusReport {
    pub fn from_reconciliation(rec: &Reconciliation) -> Self {
        let total = rec.statuses.len();
        let mut by_status: BTreeMap<&CompletionStatus, Vec<u32>> = BTreeMap::new();
        let mut partial_scheduler: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
        for s in &rec.statuses {
            by_status.entry(&s.status).or_default().push(s.param_id);
            if s.status == CompletionStatus::Partial {
                if let Some(state) = s.scheduler_state.as_deref() {
                    partial_scheduler.entry(state).or_default().push(s.param_id);
                }
            }
        }

        let order = |status: &CompletionStatus| match status {
            CompletionStatus::NoSubmission => 0,
            CompletionStatus::NoResultFiles => 1,
            CompletionStatus::EmptyResultFile => 2,
            CompletionStatus::NanFailure => 3,
            CompletionStatus::SchedulerError(_) => 4,
            CompletionStatus::UnknownFailure => 5,
            CompletionStatus::Partial => 6,
            CompletionStatus::Complete => 7,
        };
        let mut failing: Vec<(&CompletionStatus, Vec<u32>)> = by_status
            .into_iter()
            .filter(|(status, _)| **status != CompletionStatus::Complete)
            .collect();
        failing.sort_by_key(|(status, _)| order(*status));

        let incomplete = failing.iter().map(|(_, ids)| ids.len()).sum();
        let mut groups: Vec<WarningGroup> = failing
            .into_iter()
            .map(|(status, ids)| WarningGroup {
                message: status.describe(),
                ids,
            })
            .collect();
        for (state, ids) in partial_scheduler {
            groups.push(WarningGroup {
                message: format!("partial results and {state} scheduler status"),
                ids,
            });
        }
        // An empty file next to good ones leaves the id partial.
        let empty_status = CompletionStatus::EmptyResultFile.describe();
        let ids: Vec<u32> = rec.empty_result_files.iter().copied().collect();
        let already_listed = groups
            .iter()
            .any(|g| g.message == empty_status && g.ids == ids);
        if !ids.is_empty() && !already_listed {
            groups.push(WarningGroup {
                message: "at least one empty results file".to_string(),
                ids,
            });
        }

        let anomalies = rec.anomalies.iter().map(describe_anomaly).collect();
        Self {
            total,
            incomplete,
            groups,
            anomalies,
        }
    }

    pub fn render(&self, verbose: bool) -> String {
        let mut lines = Vec::new();
        if self.total > 0 {
            lines.push(format!(
                "{} paramsets have missing runs out of {} ({:.2}%)",
                self.incomplete,
                self.total,
                self.incomplete as f64 / self.total as f64 * 100.0
            ));
        }
        if verbose {
            lines.extend(self.anomalies.iter().map(|a| format!("WARNING: {a}")));
        } else if !self.anomalies.is_empty() {
            lines.push(format!(
                "WARNING: {} anomalies (duplicate runs or result counts). (Try --verbose.)",
                self.anomalies.len()
            ));
        }
        lines.extend(self.groups.iter().map(|g| g.render(self.total, verbose)));
        lines.join("\n")
    }
}

fn describe_anomaly(anomaly: &Anomaly) -> String {
    match anomaly {
        Anomaly::AmbiguousRetries { param_id, job_ids } => {
            format!("paramset {param_id} has more than one run: {}", job_ids.join(", "))
        }
        Anomaly::WrongResultCount {
            param_id,
            found,
            expected,
        } => format!("paramset {param_id} has wrong number of results: {found} (expected {expected})"),
        Anomaly::UnexpectedException {
            param_id,
            exception,
        } => format!("paramset {param_id} failed with unknown error {exception}"),
        Anomaly::UnregisteredId { param_id } => {
            format!("results found for paramset {param_id} which is not in the registry")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::reconcile::ParamStatus;

    fn status(id: u32, status: CompletionStatus) -> ParamStatus {
        ParamStatus {
            param_id: id,
            status,
            missing_result_sets: vec![],
            submission: None,
            scheduler_state: None,
            failure_detail: None,
        }
    }

    #[test]
    fn ranges_collapse_consecutive_ids() {
        assert_eq!(indices_to_str(&[1, 2, 3, 5, 7, 8]), "1-3,5,7-8");
        assert_eq!(indices_to_str(&[4]), "4");
        assert_eq!(indices_to_str(&[]), "");
    }

    #[test]
    fn blocks_are_one_based() {
        let blocks = offset_blocks(&[1000, 1, 1001, 2500]);
        assert_eq!(
            blocks,
            vec![(0, vec![1, 1000]), (1000, vec![1]), (2000, vec![500])]
        );
    }

    #[test]
    fn summary_and_verbose_rendering() {
        let group = WarningGroup {
            message: "NaN errors".to_string(),
            ids: vec![2, 3, 4, 1005],
        };
        assert_eq!(
            group.render(8, false),
            "WARNING: 4/8 = 50.00% runs had NaN errors. (Try --verbose.)"
        );
        assert_eq!(
            group.render(8, true),
            "WARNING: the following param indices had NaN errors, 4/8 = 50.00%:\n\
             [OFFSET: 0] 2-4\n[OFFSET: 1000] 5"
        );
    }

    #[test]
    fn report_groups_non_complete_statuses() {
        let rec = Reconciliation {
            statuses: vec![
                status(1, CompletionStatus::Complete),
                status(2, CompletionStatus::NanFailure),
                status(3, CompletionStatus::NoSubmission),
                status(4, CompletionStatus::NoSubmission),
            ],
            ..Default::default()
        };
        let report = StatusReport::from_reconciliation(&rec);
        assert_eq!(report.total, 4);
        assert_eq!(report.incomplete, 3);
        let messages: Vec<&str> = report.groups.iter().map(|g| g.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["no submission (probably not submitted yet)", "NaN errors"]
        );
        let text = report.render(false);
        assert!(text.starts_with("3 paramsets have missing runs out of 4 (75.00%)"));
    }
}
