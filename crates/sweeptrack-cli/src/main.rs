use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use sweeptrack_core::config::SweepConfig;
use sweeptrack_core::diagnostics::scheduler::{
    elapsed_histogram, format_duration, format_mem, Sacct, SchedulerSummary,
};
use sweeptrack_core::models::{ParameterSet, ResultRecord};
use sweeptrack_core::pipeline::{analyze, Analysis};
use sweeptrack_core::query::rank::{composite_scores, leaderboards, Leaderboard, Objective};
use sweeptrack_core::query::report::StatusReport;
use sweeptrack_core::store::database::RelationalSource;
use sweeptrack_core::store::{BackendKind, ResultSource};

#[derive(Parser)]
#[command(
    name = "sweeptrack",
    version,
    about = "Track completion and results of hyperparameter sweeps run as job arrays"
)]
struct Cli {
    /// Debug-level logs and per-id warning listings.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    #[value(name = "auto")]
    Auto,
    #[value(name = "flat")]
    Flat,
    #[value(name = "directory")]
    Directory,
    #[value(name = "relational")]
    Relational,
}

impl From<BackendArg> for BackendKind {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Auto => BackendKind::Auto,
            BackendArg::Flat => BackendKind::Flat,
            BackendArg::Directory => BackendKind::Directory,
            BackendArg::Relational => BackendKind::Relational,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OptArg {
    #[value(name = "max")]
    Max,
    #[value(name = "min")]
    Min,
}

impl From<OptArg> for Objective {
    fn from(value: OptArg) -> Self {
        match value {
            OptArg::Max => Objective::Max,
            OptArg::Min => Objective::Min,
        }
    }
}

/// Options shared by every command that runs a reconciliation pass.
#[derive(Args)]
struct SweepArgs {
    /// Flat-text directory, run-directory root or SQLite database.
    input: Option<PathBuf>,
    /// JSON config file; environment and flags override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,
    /// Directory holding slurm-<job>.out logs.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[arg(long)]
    skip_logs: bool,
    #[arg(long)]
    skip_scheduler: bool,
    /// Names for measures written without one, in order.
    #[arg(long, value_delimiter = ',')]
    measures: Option<Vec<String>>,
    /// Write measure names with `_at_` in place of `@`.
    #[arg(long)]
    safe_measure_names: bool,
    #[arg(long)]
    workers: Option<usize>,
    /// Write the normalized records to this path as JSON.
    #[arg(long)]
    output: Option<PathBuf>,
}

impl SweepArgs {
    fn to_config(&self, verbose: bool) -> Result<SweepConfig> {
        let mut config = match &self.config {
            Some(path) => SweepConfig::load(path)?,
            None => SweepConfig::default(),
        };
        config.apply_env();
        if let Some(input) = &self.input {
            config.input = Some(input.clone());
        }
        if let Some(backend) = self.backend {
            config.backend = backend.into();
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = Some(dir.clone());
        }
        if let Some(names) = &self.measures {
            config.measure_names = Some(names.clone());
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.skip_logs |= self.skip_logs;
        config.skip_scheduler |= self.skip_scheduler;
        config.safe_measure_names |= self.safe_measure_names;
        config.verbose |= verbose;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Report which parameter sets finished and why the others did not.
    Status {
        #[command(flatten)]
        sweep: SweepArgs,
        /// Print a histogram of scheduler elapsed times.
        #[arg(long)]
        time_histogram: bool,
        /// Histogram bin width in minutes.
        #[arg(long)]
        bin_minutes: Option<u64>,
    },
    /// Rank parameter sets per result-set, optionally by composite score.
    Analyze {
        #[command(flatten)]
        sweep: SweepArgs,
        #[arg(long, default_value = "P@5")]
        measure: String,
        #[arg(short = 'N', long = "top", default_value_t = 5)]
        top: usize,
        #[arg(long, value_enum, default_value_t = OptArg::Max)]
        opt: OptArg,
        /// Also rank complete parameter sets by the product of normalized measures.
        #[arg(long)]
        composite: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print one parameter set as command-line arguments.
    Params { input: PathBuf, param_id: u32 },
    /// Store `name value` lines from stdin as one result row.
    Store {
        db: PathBuf,
        param_id: u32,
        #[arg(long)]
        result_name: String,
        #[arg(long)]
        slurm_id: Option<String>,
    },
}

fn init_logging(verbose: bool) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("sweeptrack_core={level}").parse()?)
        .add_directive(format!("sweeptrack={level}").parse()?);

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    run_command(cli.command, cli.verbose)
}

fn run_command(command: Commands, verbose: bool) -> Result<()> {
    match command {
        Commands::Status {
            sweep,
            time_histogram,
            bin_minutes,
        } => {
            let mut config = sweep.to_config(verbose)?;
            if let Some(minutes) = bin_minutes {
                config.histogram_bin_minutes = minutes;
            }
            let analysis = run_pass(&config)?;
            write_snapshot(sweep.output.as_deref(), analysis.records())?;

            let report = StatusReport::from_reconciliation(&analysis.reconciliation);
            println!("{}", report.render(config.verbose));
            if let Some(summary) = &analysis.scheduler {
                print_scheduler_summary(summary, time_histogram, config.histogram_bin_minutes);
            }
            Ok(())
        }
        Commands::Analyze {
            sweep,
            measure,
            top,
            opt,
            composite,
            json,
        } => {
            let config = sweep.to_config(verbose)?;
            let analysis = run_pass(&config)?;
            write_snapshot(sweep.output.as_deref(), analysis.records())?;

            let objective = Objective::from(opt);
            let complete = analysis.complete_records();
            let boards = leaderboards(&complete, &measure, objective, top);
            let scores = if composite {
                let eligible = analysis.reconciliation.complete_ids();
                match composite_scores(&complete, &eligible, &measure, objective) {
                    Ok(scores) => Some(scores),
                    Err(e) => {
                        warn!("{e}");
                        None
                    }
                }
            } else {
                None
            };

            if json {
                let payload = json!({
                    "leaderboards": boards,
                    "composite": scores.as_ref().map(|s| &s[..s.len().min(top)]),
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
                return Ok(());
            }
            for board in &boards {
                print_leaderboard(board);
            }
            if let Some(scores) = scores {
                println!(
                    "== composite {measure} over {} complete paramsets ==",
                    scores.len()
                );
                for (rank, s) in scores.iter().take(top).enumerate() {
                    let parts: Vec<String> = s
                        .normalized
                        .iter()
                        .map(|(set, v)| format!("{set}={v:.4}"))
                        .collect();
                    println!(
                        "{:>3}. paramset {:<6} score {:.4}  ({})",
                        rank + 1,
                        s.param_id,
                        s.score,
                        parts.join(", ")
                    );
                }
            }
            Ok(())
        }
        Commands::Params { input, param_id } => {
            let source = ResultSource::open(&input, BackendKind::Auto, Default::default())?;
            let set = source
                .parameter_set(param_id)?
                .with_context(|| format!("no paramset {param_id} in {}", input.display()))?;
            println!("{}", set.to_cli_args());
            Ok(())
        }
        Commands::Store {
            db,
            param_id,
            result_name,
            slurm_id,
        } => {
            let measures = read_measure_lines(std::io::stdin().lock())?;
            let source = RelationalSource::create(&db)?;
            source.store_result(param_id, &result_name, slurm_id.as_deref(), &measures)?;
            info!(
                "stored {} measures for paramset {param_id} on {result_name} in {}",
                measures.len(),
                db.display()
            );
            Ok(())
        }
    }
}

fn run_pass(config: &SweepConfig) -> Result<Analysis> {
    let scheduler = Sacct::new(config.scheduler_program.clone());
    let analysis = analyze(config, &scheduler)?;
    info!("reconciled sweep in {} ms", analysis.elapsed_ms);
    Ok(analysis)
}

fn write_snapshot(path: Option<&Path>, records: &[ResultRecord]) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let mut file = std::io::BufWriter::new(
        std::fs::File::create(path)
            .with_context(|| format!("cannot create {}", path.display()))?,
    );
    serde_json::to_writer_pretty(&mut file, records)?;
    file.flush()?;
    info!("wrote {} records to {}", records.len(), path.display());
    Ok(())
}

/// `name value` pairs, one per line. Malformed lines are skipped.
fn read_measure_lines(reader: impl BufRead) -> Result<Vec<(String, String)>> {
    let mut measures = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            [] => {}
            [name, value] => measures.push((name.to_string(), value.to_string())),
            _ => warn!("ignoring input line {}: expected 'name value'", i + 1),
        }
    }
    Ok(measures)
}

fn print_leaderboard(board: &Leaderboard) {
    let direction = match board.objective {
        Objective::Max => "max",
        Objective::Min => "min",
    };
    println!(
        "== {}: top {} by {} ({direction}) ==",
        board.result_set,
        board.rows.len(),
        board.measure
    );
    for (rank, row) in board.rows.iter().enumerate() {
        let params = ParameterSet {
            id: row.param_id,
            values: row.params.clone(),
        };
        println!(
            "{:>3}. paramset {:<6} {}={:.4}  job {}  {}",
            rank + 1,
            row.param_id,
            board.measure,
            row.value,
            row.job_id,
            params.to_cli_args()
        );
    }
}

fn print_scheduler_summary(summary: &SchedulerSummary, histogram: bool, bin_minutes: u64) {
    if summary.jobs.is_empty() {
        return;
    }
    println!("Max memory usage: {}", format_mem(summary.max_rss_bytes));
    println!(
        "Max elapsed time: {}",
        format_duration(summary.max_elapsed_secs as f64)
    );
    if let Some(mean) = summary.mean_elapsed_secs() {
        println!("Mean elapsed time: {}", format_duration(mean));
    }
    if !histogram {
        return;
    }
    let bins = elapsed_histogram(
        &summary.elapsed_times(),
        bin_minutes.max(1) * 60,
        summary.max_elapsed_secs,
    );
    for bin in bins {
        println!(
            "{:>10} - {:<10} {:>6}  {:>6.2}%  {:>6.2}%",
            format_duration(bin.start_secs as f64),
            format_duration(bin.end_secs as f64),
            bin.count,
            bin.fraction * 100.0,
            bin.cumulative * 100.0
        );
    }
}
