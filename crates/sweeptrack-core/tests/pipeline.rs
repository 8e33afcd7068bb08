//! End-to-end passes over each storage layout.

use std::cell::RefCell;
use std::fs;
use std::path::Path;

use rusqlite::Connection;
use sweeptrack_core::config::SweepConfig;
use sweeptrack_core::diagnostics::scheduler::SchedulerBackend;
use sweeptrack_core::errors::{SweepError, SweepResult};
use sweeptrack_core::models::{CompletionStatus, ParamValue};
use sweeptrack_core::pipeline::analyze;
use sweeptrack_core::query::rank::{composite_scores, leaderboards, Objective};
use sweeptrack_core::query::report::StatusReport;
use sweeptrack_core::store::database::RelationalSource;
use sweeptrack_core::store::schema::RUNLOG_DDL;
use sweeptrack_core::store::{BackendKind, ResultSource};

const NAN_LOG: &str = "Read 12M words\n\
Progress: 41.3% words/sec/thread: 81234 lr: 0.058 loss: nan\n\
terminate called after throwing an instance of 'fasttext::DenseMatrix::EncounteredNaNError'\n\
  what():  Encountered NaN.\n";

/// Answers every query with fixed accounting rows and records the batches.
struct CannedSacct {
    rows: String,
    batches: RefCell<Vec<Vec<String>>>,
}

impl CannedSacct {
    fn new(rows: &str) -> Self {
        Self {
            rows: rows.to_string(),
            batches: RefCell::new(vec![]),
        }
    }
}

impl SchedulerBackend for CannedSacct {
    fn query(&self, base_job_ids: &[String]) -> SweepResult<String> {
        self.batches.borrow_mut().push(base_job_ids.to_vec());
        Ok(self.rows.clone())
    }
}

struct Offline;

impl SchedulerBackend for Offline {
    fn query(&self, _: &[String]) -> SweepResult<String> {
        Err(SweepError::Scheduler("sacct: command not found".into()))
    }
}

fn config_for(input: &Path) -> SweepConfig {
    SweepConfig {
        input: Some(input.to_path_buf()),
        workers: 2,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Fixtures: registry of 3 ids, submissions for 1 and 2, id 1 complete on
// {A, B}, id 2 only on A.
// ---------------------------------------------------------------------------

fn flat_sweep(root: &Path, id2_results: bool) {
    fs::write(root.join("params"), "-dim 10 -lr 0.1\n-dim 20 -lr 0.1\n-dim 30 -lr 0.1\n").unwrap();
    fs::write(root.join("runlog"), "1|700_1|/scratch/sweep\n2|700_2|/scratch/sweep\n").unwrap();
    let mut results = String::from(
        "1|dim 10-lr 0.1|700_1|A|P@5 0.40\n\
         1|dim 10-lr 0.1|700_1|B|P@5 0.30\n",
    );
    if id2_results {
        results.push_str("2|dim 20-lr 0.1|700_2|A|P@5 0.50\n");
    }
    fs::write(root.join("results"), results).unwrap();
}

fn directory_sweep(root: &Path) {
    for (id, sets) in [(1u32, vec!["A", "B"]), (2, vec!["A"]), (3, vec![])] {
        let dir = root.join(id.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("params"), format!("-dim {} -lr 0.1", id * 10)).unwrap();
        if id < 3 {
            fs::write(dir.join("slurm_id_700"), "").unwrap();
        }
        for set in sets {
            fs::write(dir.join(format!("results.{set}")), "N 1000\nP@5 0.4\n").unwrap();
        }
    }
}

fn relational_sweep(db: &Path) {
    let conn = Connection::open(db).unwrap();
    conn.execute_batch(
        "CREATE TABLE params (dim INTEGER, lr REAL);
         INSERT INTO params VALUES (10, 0.1);
         INSERT INTO params VALUES (20, 0.1);
         INSERT INTO params VALUES (30, 0.1);",
    )
    .unwrap();
    conn.execute_batch(RUNLOG_DDL).unwrap();
    conn.execute_batch(
        "INSERT INTO runlog VALUES (1, '700_1', '/scratch/sweep');
         INSERT INTO runlog VALUES (2, '700_2', '/scratch/sweep');",
    )
    .unwrap();
    drop(conn);

    let source = RelationalSource::open(db).unwrap();
    let p5 = |v: &str| vec![("P@5".to_string(), v.to_string())];
    source.store_result(1, "A", Some("700_1"), &p5("0.40")).unwrap();
    source.store_result(1, "B", Some("700_1"), &p5("0.30")).unwrap();
    source.store_result(2, "A", Some("700_2"), &p5("0.50")).unwrap();
}

fn assert_three_id_scenario(config: &SweepConfig) {
    let analysis = analyze(config, &Offline).unwrap();
    let rec = &analysis.reconciliation;
    assert_eq!(rec.statuses.len(), 3);
    assert_eq!(rec.status_of(1).unwrap().status, CompletionStatus::Complete);
    let two = rec.status_of(2).unwrap();
    assert_eq!(two.status, CompletionStatus::Partial);
    assert_eq!(two.missing_result_sets, vec!["B".to_string()]);
    assert_eq!(rec.status_of(3).unwrap().status, CompletionStatus::NoSubmission);
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn flat_layout_three_id_scenario() {
    let dir = tempfile::tempdir().unwrap();
    flat_sweep(dir.path(), true);
    assert_three_id_scenario(&config_for(dir.path()));
}

#[test]
fn directory_layout_three_id_scenario() {
    let dir = tempfile::tempdir().unwrap();
    directory_sweep(dir.path());
    let config = SweepConfig {
        backend: BackendKind::Directory,
        ..config_for(dir.path())
    };
    assert_three_id_scenario(&config);
}

#[test]
fn relational_layout_three_id_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sweep.db");
    relational_sweep(&db);
    assert_eq!(
        ResultSource::open(&db, BackendKind::Auto, Default::default())
            .unwrap()
            .kind(),
        BackendKind::Relational
    );
    assert_three_id_scenario(&config_for(&db));
}

#[test]
fn nan_log_reclassifies_missing_results() {
    let dir = tempfile::tempdir().unwrap();
    flat_sweep(dir.path(), false);

    let skip_logs = SweepConfig {
        skip_logs: true,
        ..config_for(dir.path())
    };
    let plain = analyze(&skip_logs, &Offline).unwrap();
    assert_eq!(
        plain.reconciliation.status_of(2).unwrap().status,
        CompletionStatus::UnknownFailure
    );

    let logs = dir.path().join("logs");
    fs::create_dir_all(&logs).unwrap();
    fs::write(logs.join("slurm-700_2.out"), NAN_LOG).unwrap();
    let config = SweepConfig {
        log_dir: Some(logs),
        ..config_for(dir.path())
    };
    let analysis = analyze(&config, &Offline).unwrap();
    assert_eq!(
        analysis.reconciliation.status_of(2).unwrap().status,
        CompletionStatus::NanFailure
    );
}

#[test]
fn submitted_ids_without_any_results_have_no_result_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("params"), "-dim 10\n-dim 20\n").unwrap();
    fs::write(dir.path().join("runlog"), "1|700_1|/scratch/sweep\n").unwrap();
    let logs = dir.path().join("logs");
    fs::create_dir_all(&logs).unwrap();
    fs::write(logs.join("slurm-700_1.out"), NAN_LOG).unwrap();

    let config = SweepConfig {
        log_dir: Some(logs),
        ..config_for(dir.path())
    };
    let analysis = analyze(&config, &Offline).unwrap();
    let rec = &analysis.reconciliation;
    assert!(rec.universe.is_empty());
    assert_eq!(rec.status_of(1).unwrap().status, CompletionStatus::NoResultFiles);
    assert_eq!(rec.status_of(2).unwrap().status, CompletionStatus::NoSubmission);
    assert!(analysis.evidence.log_verdicts.is_empty());
}

#[test]
fn scheduler_error_state_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    flat_sweep(dir.path(), false);
    let sacct = CannedSacct::new(
        "700_1|COMPLETED|3600|\n\
         700_1.batch|COMPLETED|3600|2048K\n\
         700_2|OUT_OF_MEMORY|120|\n\
         700_2.batch|OUT_OF_MEMORY|120|4G\n",
    );
    let analysis = analyze(&config_for(dir.path()), &sacct).unwrap();

    assert_eq!(*sacct.batches.borrow(), vec![vec!["700".to_string()]]);
    assert_eq!(
        analysis.reconciliation.status_of(2).unwrap().status,
        CompletionStatus::SchedulerError("OUT_OF_MEMORY".into())
    );
    let summary = analysis.scheduler.as_ref().unwrap();
    assert_eq!(summary.max_elapsed_secs, 3600);
    assert_eq!(summary.max_rss_bytes, 4.0 * 1024.0 * 1024.0 * 1024.0);

    let report = StatusReport::from_reconciliation(&analysis.reconciliation);
    let text = report.render(true);
    assert!(text.contains("OUT_OF_MEMORY"));
    assert!(text.contains("[OFFSET: 0] 2"));
}

#[test]
fn flat_params_are_carried_into_rankings() {
    let dir = tempfile::tempdir().unwrap();
    flat_sweep(dir.path(), true);
    let analysis = analyze(&config_for(dir.path()), &Offline).unwrap();

    // Partial id 2 has the best score on A but is not ranked.
    let complete = analysis.complete_records();
    let boards = leaderboards(&complete, "P@5", Objective::Max, 5);
    assert_eq!(boards.len(), 2);
    let a = &boards[0];
    assert_eq!(a.result_set, "A");
    assert_eq!(a.rows.len(), 1);
    assert_eq!(a.rows[0].param_id, 1);
    assert_eq!(a.rows[0].params["dim"], Some(ParamValue::Int(10)));
    assert!(boards.iter().all(|b| b.rows.iter().all(|r| r.param_id != 2)));

    let scores = composite_scores(
        &complete,
        &analysis.reconciliation.complete_ids(),
        "P@5",
        Objective::Max,
    )
    .unwrap();
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0].param_id, 1);
    assert!((scores[0].score - 0.8).abs() < 1e-12);
}

#[test]
fn directory_empty_result_file_is_distinguished() {
    let dir = tempfile::tempdir().unwrap();
    directory_sweep(dir.path());
    let three = dir.path().join("3");
    fs::write(three.join("slurm_id_701"), "").unwrap();
    fs::write(three.join("results.A"), "").unwrap();

    let config = SweepConfig {
        skip_logs: true,
        ..config_for(dir.path())
    };
    let analysis = analyze(&config, &Offline).unwrap();
    let three = analysis.reconciliation.status_of(3).unwrap();
    assert_eq!(three.status, CompletionStatus::EmptyResultFile);
    assert_eq!(three.submission.as_ref().unwrap().job_id, "701_3");
}

#[test]
fn relational_parameter_fetch_renders_cli_args() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sweep.db");
    relational_sweep(&db);
    let source = ResultSource::open(&db, BackendKind::Relational, Default::default()).unwrap();
    let set = source.parameter_set(2).unwrap().unwrap();
    assert_eq!(set.to_cli_args(), "-dim 20 -lr 0.1");
    assert!(source.parameter_set(9).unwrap().is_none());
}
