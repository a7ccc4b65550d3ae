use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ralph_config::Config;
use ralph_core::Orchestrator;
use ralph_events::EventBus;
use ralph_types::{Event, EventType, RunStatus};

#[derive(Parser, Debug)]
#[command(name = "ralph", version)]
#[command(about = "Orchestrates autonomous coding agents across a dependency-ordered batch of units")]
struct Cli {
    /// Path to the repository root (defaults to the current directory).
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Path to the config file (defaults to `<repo>/.ralph.yaml`, or built-in defaults if absent).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a durable sqlite-class store (default: `~/.ralph/daemon.db`).
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Disable persistence entirely: the run is neither recorded nor resumable.
    #[arg(long, global = true)]
    no_persist: bool,

    #[command(subcommand)]
    cmd: Commands,
}

/// Resolves the effective store path per §6's "optional durable store at
/// `~/.ralph/daemon.db`": an explicit `--store` wins, otherwise that default path is
/// used unless `--no-persist` was passed.
fn resolve_store_path(cli: &Cli) -> Result<Option<PathBuf>> {
    if cli.no_persist {
        return Ok(None);
    }
    if let Some(path) = &cli.store {
        return Ok(Some(path.clone()));
    }
    let home = dirs::home_dir().context("could not determine home directory for the default store path")?;
    Ok(Some(home.join(".ralph").join("daemon.db")))
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover units under `tasks_dir` and drive them to completion.
    Run {
        /// Directory containing per-unit task trees.
        tasks_dir: PathBuf,

        /// Branch that worker output is eventually merged into.
        #[arg(long)]
        feature_branch: String,

        /// Identifier for this run (default: derived from the feature branch and start time).
        #[arg(long)]
        run_id: Option<String>,

        /// Skip PR creation, review, and merge; units stop after baseline checks pass.
        #[arg(long)]
        no_pr: bool,
    },
    /// Resume a previously interrupted run from the attached store.
    Resume {
        run_id: String,

        /// Directory containing per-unit task trees (same value used for the original run).
        tasks_dir: PathBuf,

        #[arg(long)]
        no_pr: bool,
    },
    /// List resumable runs from the attached store.
    Status,
    /// Read newline-delimited JSON events from stdin (as emitted by a child `run`
    /// process) and re-broadcast them through a fresh event bus, printing a
    /// human-readable shadow of each one.
    Daemon,
}

struct CliReporter;

trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[error] {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from_file(path).with_context(|| format!("loading config from {}", path.display()))?;
            config.apply_env_overrides();
            config.validate().context("validating config")?;
            config
        }
        // `Config::load` already applies env overrides and validates.
        None => Config::load(&cli.repo).context("loading config")?,
    };

    let store_path = resolve_store_path(&cli)?;

    match cli.cmd {
        Commands::Run { tasks_dir, feature_branch, run_id, no_pr } => {
            let run_id = run_id.unwrap_or_else(|| default_run_id(&feature_branch));
            let orchestrator = build_orchestrator(&cli.repo, config, store_path.as_deref())?;
            run_with_reporter(&orchestrator, &run_id, &tasks_dir, &feature_branch, no_pr)
        }
        Commands::Resume { run_id, tasks_dir, no_pr } => {
            let store_path = store_path.context("a store path is required to resume a run")?;
            let orchestrator = build_orchestrator(&cli.repo, config, Some(&store_path))?;
            let resumable = orchestrator.resumable_runs().context("listing resumable runs")?;
            let record = resumable
                .into_iter()
                .find(|r| r.id == run_id)
                .with_context(|| format!("run {run_id} is not pending or running in {}", store_path.display()))?;
            run_with_reporter(&orchestrator, &run_id, &tasks_dir, &record.feature_branch, no_pr)
        }
        Commands::Status => {
            let store_path = store_path.context("a store path is required for status")?;
            let orchestrator = build_orchestrator(&cli.repo, config, Some(&store_path))?;
            let resumable = orchestrator.resumable_runs().context("listing resumable runs")?;
            if resumable.is_empty() {
                println!("no resumable runs");
            }
            for record in resumable {
                println!(
                    "{} [{}] feature_branch={} tasks_dir={}",
                    record.id,
                    status_label(record.status),
                    record.feature_branch,
                    record.tasks_dir.display()
                );
            }
            Ok(())
        }
        Commands::Daemon => run_daemon(),
    }
}

fn build_orchestrator(repo: &std::path::Path, config: Config, store_path: Option<&std::path::Path>) -> Result<Orchestrator> {
    let orchestrator = Orchestrator::new(repo.to_path_buf(), config);
    match store_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
            }
            let store = ralph_store::Store::open(path).with_context(|| format!("opening store at {}", path.display()))?;
            Ok(orchestrator.with_store(store))
        }
        None => Ok(orchestrator),
    }
}

/// Subscribes a human-readable reporter to the orchestrator's event bus for the
/// duration of one run, then drives the run to completion on this thread. The event
/// bus is the structured channel (§4.1); this reporter is a human-readable shadow of
/// the same lifecycle events, never a replacement for it.
fn run_with_reporter(orchestrator: &Orchestrator, run_id: &str, tasks_dir: &std::path::Path, feature_branch: &str, no_pr: bool) -> Result<()> {
    let (event_rx, subscription) = orchestrator.events().subscribe_default();
    let outcome = std::thread::scope(|scope| {
        let reporter_handle = scope.spawn(move || {
            let mut reporter = CliReporter;
            while let Ok(event) = event_rx.recv() {
                report_event(&mut reporter, &event);
            }
        });

        let outcome = orchestrator.run(run_id, tasks_dir, feature_branch, no_pr);
        subscription.release();
        let _ = reporter_handle.join();
        outcome
    })
    .context("running batch")?;

    println!("run {} finished: {}", outcome.run.id, status_label(outcome.run.status));
    for (unit_id, status) in &outcome.unit_statuses {
        println!("  {unit_id}: {status:?}");
    }

    if outcome.run.status == RunStatus::Failed {
        anyhow::bail!(outcome.run.error.unwrap_or_else(|| "one or more units did not complete".to_string()));
    }
    Ok(())
}

fn report_event(reporter: &mut dyn Reporter, event: &Event) {
    let unit = event.unit.as_deref().unwrap_or("-");
    match &event.event_type {
        EventType::UnitQueued => reporter.info(&format!("{unit}: queued")),
        EventType::UnitStarted => reporter.info(&format!("{unit}: started")),
        EventType::UnitCompleted => reporter.info(&format!("{unit}: completed")),
        EventType::UnitFailed { message } => reporter.error(&format!("{unit}: failed: {message}")),
        EventType::UnitBlocked { blocking_predecessor } => {
            reporter.warn(&format!("{unit}: blocked on {blocking_predecessor}"))
        }
        EventType::TaskStarted => reporter.info(&format!("{unit}: task {} started", event.task.unwrap_or_default())),
        EventType::TaskCompleted => reporter.info(&format!("{unit}: task {} completed", event.task.unwrap_or_default())),
        EventType::TaskAgentIteration { attempt, .. } => reporter.info(&format!("{unit}: agent iteration {attempt}")),
        EventType::TaskAgentOutput { .. } => {}
        EventType::PrCreated { number, html_url } => reporter.info(&format!("{unit}: opened PR #{number} ({html_url})")),
        EventType::PrReviewPending => reporter.info(&format!("{unit}: review pending")),
        EventType::PrReviewInReview => reporter.info(&format!("{unit}: in review")),
        EventType::PrReviewChangesRequested => reporter.warn(&format!("{unit}: changes requested")),
        EventType::PrReviewApproved => reporter.info(&format!("{unit}: review approved")),
        EventType::PrConflict { files } => reporter.warn(&format!("{unit}: rebase conflict in {}", files.join(", "))),
        EventType::PrMerged => reporter.info(&format!("{unit}: merged")),
        EventType::MergeMutexAcquired => {}
        EventType::MergeMutexReleased => {}
        EventType::OrchRunStarted => reporter.info("run started"),
        EventType::OrchRunFinished { result } => reporter.info(&format!("run finished: {result:?}")),
        EventType::CodeReviewEscalated { severity, message } => reporter.warn(&format!("{unit}: code review escalation ({severity:?}): {message}")),
    }
}

/// Reads newline-delimited JSON events from stdin, as emitted by a child `run`
/// process in headless mode (§6), and re-broadcasts them through a fresh bus while
/// printing a human-readable shadow of each one. Malformed lines are logged and
/// skipped rather than aborting ingestion.
fn run_daemon() -> Result<()> {
    use std::io::BufRead;

    let bus = EventBus::new();
    let (event_rx, subscription) = bus.subscribe_default();
    std::thread::scope(|scope| {
        let reporter_handle = scope.spawn(move || {
            let mut reporter = CliReporter;
            while let Ok(event) = event_rx.recv() {
                report_event(&mut reporter, &event);
            }
        });

        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    eprintln!("[warn] failed to read stdin: {err}");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            if let Err(err) = bus.ingest_raw(&line, "child-run") {
                eprintln!("[warn] skipping malformed event line: {err}");
            }
        }

        subscription.release();
        let _ = reporter_handle.join();
    });
    Ok(())
}

fn default_run_id(feature_branch: &str) -> String {
    let slug: String = feature_branch.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '-' }).collect();
    format!("{slug}-{}", chrono::Utc::now().format("%Y%m%dT%H%M%SZ"))
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Complete => "complete",
        RunStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestReporter {
        infos: Vec<String>,
        warns: Vec<String>,
        errors: Vec<String>,
    }

    impl TestReporter {
        fn new() -> Self {
            TestReporter { infos: Vec::new(), warns: Vec::new(), errors: Vec::new() }
        }
    }

    impl Reporter for TestReporter {
        fn info(&mut self, msg: &str) {
            self.infos.push(msg.to_string());
        }

        fn warn(&mut self, msg: &str) {
            self.warns.push(msg.to_string());
        }

        fn error(&mut self, msg: &str) {
            self.errors.push(msg.to_string());
        }
    }

    fn sample_event(unit: Option<&str>, event_type: EventType) -> Event {
        Event { timestamp: chrono::Utc::now(), event_type, unit: unit.map(str::to_string), task: None, pr: None, error: None }
    }

    #[test]
    fn report_event_routes_failure_to_error_level() {
        let mut reporter = TestReporter::new();
        report_event(&mut reporter, &sample_event(Some("01-setup"), EventType::UnitFailed { message: "boom".into() }));
        assert_eq!(reporter.errors, vec!["01-setup: failed: boom".to_string()]);
        assert!(reporter.infos.is_empty());
    }

    #[test]
    fn report_event_routes_conflict_to_warn_level() {
        let mut reporter = TestReporter::new();
        report_event(&mut reporter, &sample_event(Some("01-setup"), EventType::PrConflict { files: vec!["file.x".into()] }));
        assert_eq!(reporter.warns, vec!["01-setup: rebase conflict in file.x".to_string()]);
    }

    #[test]
    fn report_event_ignores_agent_output_chunks() {
        let mut reporter = TestReporter::new();
        report_event(
            &mut reporter,
            &sample_event(Some("01-setup"), EventType::TaskAgentOutput { stream: ralph_types::OutputStream::Stdout, chunk: "hi".into() }),
        );
        assert!(reporter.infos.is_empty());
        assert!(reporter.warns.is_empty());
        assert!(reporter.errors.is_empty());
    }

    #[test]
    fn default_run_id_slugifies_the_feature_branch() {
        let id = default_run_id("agents/batch-1");
        assert!(id.starts_with("agents-batch-1-"));
    }

    #[test]
    fn status_label_matches_every_variant() {
        assert_eq!(status_label(RunStatus::Pending), "pending");
        assert_eq!(status_label(RunStatus::Running), "running");
        assert_eq!(status_label(RunStatus::Complete), "complete");
        assert_eq!(status_label(RunStatus::Failed), "failed");
    }

    #[test]
    fn cli_reporter_methods_are_callable() {
        let mut reporter = CliReporter;
        reporter.info("info");
        reporter.warn("warn");
        reporter.error("error");
    }
}
