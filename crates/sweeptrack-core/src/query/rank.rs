//! Top-N selection per result-set and the multi-result-set composite score.
//!
//! Ties on the ranked measure are broken by ascending parameter id.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{SweepError, SweepResult};
use crate::models::{ParamValue, ResultRecord};
use crate::query::reconcile::expected_universe;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    Max,
    Min,
}

impl Objective {
    fn order(self, a: f64, b: f64) -> Ordering {
        match self {
            Objective::Max => b.total_cmp(&a),
            Objective::Min => a.total_cmp(&b),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RankedRow {
    pub param_id: u32,
    pub job_id: String,
    pub value: f64,
    pub measures: IndexMap<String, f64>,
    pub params: IndexMap<String, Option<ParamValue>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Leaderboard {
    pub result_set: String,
    pub measure: String,
    pub objective: Objective,
    pub rows: Vec<RankedRow>,
}

/// Best `n` records of one result-set by `measure`. Records lacking the
/// measure are left out; asking for more rows than exist returns them all.
pub fn top_n<'a>(
    records: &'a [ResultRecord],
    result_set: &str,
    measure: &str,
    objective: Objective,
    n: usize,
) -> Vec<(&'a ResultRecord, f64)> {
    let mut scored: Vec<(&ResultRecord, f64)> = records
        .iter()
        .filter(|r| r.result_set == result_set)
        .filter_map(|r| r.measure(measure).map(|v| (r, v)))
        .collect();
    scored.sort_by(|(ra, va), (rb, vb)| {
        objective
            .order(*va, *vb)
            .then_with(|| ra.param_id.cmp(&rb.param_id))
    });
    scored.truncate(n);
    scored
}

/// One leaderboard per result-set, in result-set name order.
pub fn leaderboards(
    records: &[ResultRecord],
    measure: &str,
    objective: Objective,
    n: usize,
) -> Vec<Leaderboard> {
    expected_universe(records)
        .into_iter()
        .map(|result_set| {
            let rows = top_n(records, &result_set, measure, objective, n)
                .into_iter()
                .map(|(r, value)| RankedRow {
                    param_id: r.param_id,
                    job_id: r.job_id.clone(),
                    value,
                    measures: r.measures.clone(),
                    params: r.params.clone(),
                })
                .collect();
            Leaderboard {
                result_set,
                measure: measure.to_string(),
                objective,
                rows,
            }
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompositeScore {
    pub param_id: u32,
    pub score: f64,
    /// Per result-set value divided by that result-set's best value.
    pub normalized: BTreeMap<String, f64>,
}

/// Product of max-normalized measures across every result-set, for ids in
/// `eligible` only. Minimization has no well-defined normalization here and
/// is rejected.
pub fn composite_scores(
    records: &[ResultRecord],
    eligible: &BTreeSet<u32>,
    measure: &str,
    objective: Objective,
) -> SweepResult<Vec<CompositeScore>> {
    if objective == Objective::Min {
        return Err(SweepError::Scoring(
            "composite scoring normalizes by the best (maximum) value; use --opt max".to_string(),
        ));
    }

    let universe = expected_universe(records);
    let mut best: BTreeMap<&str, f64> = BTreeMap::new();
    let mut values: BTreeMap<u32, BTreeMap<&str, f64>> = BTreeMap::new();
    for r in records {
        let Some(v) = r.measure(measure) else {
            continue;
        };
        best.entry(r.result_set.as_str())
            .and_modify(|b| *b = b.max(v))
            .or_insert(v);
        if eligible.contains(&r.param_id) {
            values
                .entry(r.param_id)
                .or_default()
                .entry(r.result_set.as_str())
                .or_insert(v);
        }
    }

    for set in &universe {
        match best.get(set.as_str()) {
            Some(b) if *b > 0.0 && b.is_finite() => {}
            Some(b) => {
                return Err(SweepError::Scoring(format!(
                    "best {measure} on {set} is {b}; cannot normalize by it"
                )))
            }
            None => {
                return Err(SweepError::Scoring(format!(
                    "no result on {set} reports {measure}"
                )))
            }
        }
    }

    let mut scores: Vec<CompositeScore> = values
        .into_iter()
        .filter_map(|(param_id, per_set)| {
            if per_set.len() != universe.len() {
                debug!("paramset {param_id} lacks {measure} on some result-sets; not scored");
                return None;
            }
            let normalized: BTreeMap<String, f64> = per_set
                .iter()
                .map(|(set, v)| (set.to_string(), v / best[set]))
                .collect();
            let score: f64 = normalized.values().product();
            Some(CompositeScore {
                param_id,
                score,
                normalized,
            })
        })
        .collect();
    scores.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.param_id.cmp(&b.param_id))
    });
    Ok(scores)
}
