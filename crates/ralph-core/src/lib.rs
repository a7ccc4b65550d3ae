//! Orchestrator assembly (§8 entrypoint): wires discovery, the scheduler, the worker
//! pool, the merge pipeline, escalation, and persistence into a single `run()` call.
//!
//! Acquire resources, load-or-init mutable state, record a start event, drive the
//! work, record an end event: a worker pool of `config.parallelism` threads drains a
//! single live, dependency-respecting ready queue via `std::thread::scope`, which
//! lets every worker borrow the scheduler, the per-unit state, and the shared
//! `WorkerContext` without `Arc`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc::Receiver;

use chrono::Utc;
use ralph::{
    CompositeEscalator, Escalator, GithubPrGateway, MergePipeline, OrchestratorError, Scheduler,
    TerminalEscalator, WebhookEscalator, WorkerContext, discover, run_unit,
};
use ralph_config::{Config, RepoField};
use ralph_events::EventBus;
use ralph_types::{Event, EventType, Run, RunResult, RunStatus, Unit, UnitRuntimeState, UnitStatus};

/// The outcome of one `Orchestrator::run()` call.
pub struct RunOutcome {
    pub run: Run,
    pub unit_statuses: HashMap<String, UnitStatus>,
}

/// Wires every orchestration component together for one repository and config. One
/// `Orchestrator` drives exactly one run; build a new one per run.
pub struct Orchestrator {
    repo_root: PathBuf,
    config: Config,
    events: EventBus,
    store: Option<Mutex<ralph_store::Store>>,
}

impl Orchestrator {
    pub fn new(repo_root: impl Into<PathBuf>, config: Config) -> Self {
        Orchestrator { repo_root: repo_root.into(), config, events: EventBus::new(), store: None }
    }

    /// Attach a persistence backend (§4.10). With a store attached, every unit
    /// transition and every raw event this run emits is durably recorded and the run
    /// becomes resumable via `resumable_runs`.
    pub fn with_store(mut self, store: ralph_store::Store) -> Self {
        self.store = Some(Mutex::new(store));
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Runs left `pending`/`running` in the attached store. Used by the CLI's
    /// `resume` subcommand; returns an empty list when no store is attached.
    pub fn resumable_runs(&self) -> anyhow::Result<Vec<Run>> {
        match &self.store {
            Some(store) => store.lock().expect("store mutex poisoned").resumable_runs(),
            None => Ok(Vec::new()),
        }
    }

    /// Discovers the unit graph under `tasks_dir`, drives every unit through the
    /// worker pool to completion or terminal failure, and returns the final run/unit
    /// statuses. Does not itself retry a failed run — call this again with the same
    /// `run_id` semantics the caller wants for that (the scheduler's `Blocked`
    /// propagation means a failed unit's successors are not reclaimable within a
    /// single call, per §4.4).
    pub fn run(&self, run_id: &str, tasks_dir: &Path, feature_branch: &str, no_pr: bool) -> Result<RunOutcome, OrchestratorError> {
        let discovery = discover(tasks_dir)?;
        let unit_ids: Vec<String> = discovery.units.iter().map(|u| u.id.clone()).collect();

        let mut run_record = Run {
            id: run_id.to_string(),
            repo_path: self.repo_root.clone(),
            target_branch: self.config.target_branch.clone(),
            feature_branch: feature_branch.to_string(),
            tasks_dir: tasks_dir.to_path_buf(),
            parallelism: self.config.parallelism,
            status: RunStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            error: None,
        };
        if let Some(store) = &self.store {
            store.lock().expect("store mutex poisoned").insert_run(&run_record).map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        }

        // Subscribe before emitting anything so the persistence subscriber cannot
        // miss the run's opening events.
        let (event_rx, subscription) = self.events.subscribe_default();
        self.events.emit(run_event(EventType::OrchRunStarted));

        let (scheduler, initial_events) = Scheduler::register(discovery.graph, &unit_ids);
        for event in initial_events {
            self.events.emit(event);
        }

        let units: HashMap<String, Mutex<Unit>> = discovery.units.into_iter().map(|u| (u.id.clone(), Mutex::new(u))).collect();

        let pr_gateway_for_worker = self.build_pr_gateway()?;
        let pr_gateway_for_merge = self.build_pr_gateway()?;
        let escalator = self.build_escalator()?;
        let merge_pipeline = MergePipeline::new(Box::new(pr_gateway_for_merge), self.config.merge.max_conflict_retries);

        let ctx = WorkerContext {
            repo_root: &self.repo_root,
            config: &self.config,
            events: &self.events,
            escalator: &escalator,
            pr_gateway: &pr_gateway_for_worker,
            merge_pipeline: &merge_pipeline,
            no_pr,
        };

        std::thread::scope(|scope| {
            let persistence_handle = self.store.as_ref().map(|store| {
                let run_id = run_record.id.clone();
                scope.spawn(move || persist_events(store, &run_id, event_rx))
            });

            // A nested scope so this blocks until every worker has drained the
            // scheduler, while the persistence thread keeps consuming concurrently.
            std::thread::scope(|worker_scope| {
                for _ in 0..self.config.parallelism.max(1) {
                    worker_scope.spawn(|| worker_loop(&scheduler, &units, &ctx));
                }
            });

            // Closing the subscription drops its sender, which ends the persistence
            // thread's `recv()` loop.
            subscription.release();
            if let Some(handle) = persistence_handle {
                let _ = handle.join();
            }
        });

        let mut unit_statuses = HashMap::new();
        let mut any_failed = false;
        for id in &unit_ids {
            let status = scheduler.status_of(id).unwrap_or_default();
            if matches!(status, UnitStatus::Failed | UnitStatus::Blocked) {
                any_failed = true;
            }
            unit_statuses.insert(id.clone(), status);
        }

        let result = if any_failed { RunResult::PartialFailure } else { RunResult::Success };
        self.events.emit(run_event(EventType::OrchRunFinished { result }));

        run_record.status = if any_failed { RunStatus::Failed } else { RunStatus::Complete };
        run_record.completed_at = Some(Utc::now());
        if any_failed {
            run_record.error = Some("one or more units failed or were blocked".to_string());
        }
        if let Some(store) = &self.store {
            store
                .lock()
                .expect("store mutex poisoned")
                .update_run_status(&run_record.id, run_record.status, run_record.completed_at, run_record.error.as_deref())
                .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        }

        Ok(RunOutcome { run: run_record, unit_statuses })
    }

    fn build_pr_gateway(&self) -> Result<GithubPrGateway, OrchestratorError> {
        let needs_detect = matches!(self.config.github.owner, RepoField::Auto) || matches!(self.config.github.repo, RepoField::Auto);
        let detected =
            if needs_detect { Some(ralph_config::detect_github_owner_repo(&self.repo_root).map_err(OrchestratorError::Other)?) } else { None };
        let owner = match &self.config.github.owner {
            RepoField::Named(name) => name.clone(),
            RepoField::Auto => detected.as_ref().expect("detected owner/repo when owner is auto").0.clone(),
        };
        let repo = match &self.config.github.repo {
            RepoField::Named(name) => name.clone(),
            RepoField::Auto => detected.as_ref().expect("detected owner/repo when repo is auto").1.clone(),
        };
        GithubPrGateway::new(owner, repo).map_err(OrchestratorError::Other)
    }

    /// Always includes the terminal backend; adds the webhook backend when
    /// `config.webhook.enabled`. There is no separate chat-escalation config section,
    /// so `ChatEscalator` (available in `ralph`'s public API) is never wired here.
    fn build_escalator(&self) -> Result<CompositeEscalator, OrchestratorError> {
        let mut backends: Vec<Box<dyn Escalator>> = vec![Box::new(TerminalEscalator)];
        if self.config.webhook.enabled {
            let webhook = WebhookEscalator::new(self.config.webhook.clone()).map_err(OrchestratorError::Other)?;
            backends.push(Box::new(webhook));
        }
        Ok(CompositeEscalator::new(backends))
    }
}

fn worker_loop(scheduler: &Scheduler, units: &HashMap<String, Mutex<Unit>>, ctx: &WorkerContext<'_>) {
    while let Some(unit_id) = scheduler.dispatch() {
        let Some(lock) = units.get(&unit_id) else { continue };
        let mut unit = lock.lock().expect("unit mutex poisoned");
        match run_unit(ctx, &mut unit) {
            Ok(()) => {
                for event in scheduler.complete(&unit_id) {
                    ctx.events.emit(event);
                }
            }
            Err(err) => {
                for event in scheduler.fail(&unit_id, err.to_string()) {
                    ctx.events.emit(event);
                }
            }
        }
    }
}

/// Drains the event bus into the store, accumulating per-unit state across events
/// rather than persisting each event's own (mostly empty) payload directly — the
/// store's `upsert_unit` overwrites every column on each call, so a caller that
/// didn't accumulate would clobber previously-persisted fields like `pr_number` the
/// next time a unit's status changed.
fn persist_events(store: &Mutex<ralph_store::Store>, run_id: &str, rx: Receiver<Event>) {
    let mut states: HashMap<String, UnitRuntimeState> = HashMap::new();
    while let Ok(event) = rx.recv() {
        if let Some(unit_id) = event.unit.clone() {
            let state = states.entry(unit_id.clone()).or_default();
            apply_event_to_state(state, &event);
            let mut guard = store.lock().expect("store mutex poisoned");
            if let Err(err) = guard.upsert_unit(run_id, &unit_id, state) {
                tracing::warn!("failed to persist unit state for {unit_id}: {err}");
            }
        }
        let mut guard = store.lock().expect("store mutex poisoned");
        if let Err(err) = guard.append_event(run_id, &event) {
            tracing::warn!("failed to persist event: {err}");
        }
    }
}

/// Note: no `EventType` variant carries a unit's worktree path or branch name, so
/// those two `UnitRuntimeState` fields are never populated from the event stream.
fn apply_event_to_state(state: &mut UnitRuntimeState, event: &Event) {
    match &event.event_type {
        EventType::UnitStarted => {
            state.status = UnitStatus::InProgress;
            state.started_at = Some(event.timestamp);
        }
        EventType::UnitQueued => {
            state.status = UnitStatus::Ready;
        }
        EventType::UnitCompleted => {
            state.status = UnitStatus::Complete;
            state.completed_at = Some(event.timestamp);
        }
        EventType::UnitFailed { message } => {
            state.status = UnitStatus::Failed;
            state.completed_at = Some(event.timestamp);
            state.error = Some(message.clone());
        }
        EventType::UnitBlocked { .. } => {
            state.status = UnitStatus::Blocked;
        }
        EventType::PrCreated { number, .. } => {
            state.pr_number = Some(*number);
        }
        _ => {}
    }
}

fn run_event(event_type: EventType) -> Event {
    Event { timestamp: Utc::now(), event_type, unit: None, task: None, pr: None, error: None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_event_to_state_tracks_unit_lifecycle() {
        let mut state = UnitRuntimeState::default();
        apply_event_to_state(&mut state, &sample_event(EventType::UnitStarted));
        assert_eq!(state.status, UnitStatus::InProgress);
        assert!(state.started_at.is_some());

        apply_event_to_state(&mut state, &sample_event(EventType::PrCreated { number: 7, html_url: String::new() }));
        assert_eq!(state.pr_number, Some(7));
        // A later status transition must not clobber the pr_number set above.
        apply_event_to_state(&mut state, &sample_event(EventType::UnitCompleted));
        assert_eq!(state.status, UnitStatus::Complete);
        assert_eq!(state.pr_number, Some(7));
    }

    #[test]
    fn apply_event_to_state_records_failure_message() {
        let mut state = UnitRuntimeState::default();
        apply_event_to_state(&mut state, &sample_event(EventType::UnitFailed { message: "boom".into() }));
        assert_eq!(state.status, UnitStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("boom"));
    }

    fn sample_event(event_type: EventType) -> Event {
        Event { timestamp: Utc::now(), event_type, unit: Some("01-setup".into()), task: None, pr: None, error: None }
    }

    #[test]
    fn build_escalator_succeeds_with_webhook_disabled() {
        let orchestrator = Orchestrator::new(PathBuf::from("/tmp/repo"), Config::default());
        assert!(orchestrator.build_escalator().is_ok());
    }

    #[test]
    fn build_escalator_fails_when_webhook_enabled_without_url() {
        let mut config = Config::default();
        config.webhook.enabled = true;
        config.webhook.url = None;
        let orchestrator = Orchestrator::new(PathBuf::from("/tmp/repo"), config);
        assert!(orchestrator.build_escalator().is_err());
    }

    #[test]
    fn resumable_runs_is_empty_without_a_store() {
        let orchestrator = Orchestrator::new(PathBuf::from("/tmp/repo"), Config::default());
        assert!(orchestrator.resumable_runs().unwrap().is_empty());
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod run_integration_tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use std::io::Write as _;
    use tempfile::tempdir;

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = std::env::var(key).ok();
            unsafe { std::env::set_var(key, value) };
            EnvGuard { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.previous {
                Some(v) => unsafe { std::env::set_var(self.key, v) },
                None => unsafe { std::env::remove_var(self.key) },
            }
        }
    }

    fn write_executable(path: &std::path::Path, script: &str) {
        let mut f = fs::File::create(path).unwrap();
        writeln!(f, "#!/usr/bin/env sh").unwrap();
        writeln!(f, "{script}").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    fn write_unit(root: &std::path::Path, id: &str) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("IMPLEMENTATION_PLAN.md"), format!("---\nunit: {id}\ndepends_on: []\n---\n# Plan\n")).unwrap();
        fs::write(dir.join("01-do.md"), "---\ntask: 1\nstatus: pending\nbackpressure: \"true\"\ndepends_on: []\n---\n# Do the thing\nBody.\n").unwrap();
    }

    #[test]
    #[serial]
    fn run_completes_a_single_independent_unit_with_no_pr() {
        let repo_root = tempdir().unwrap();
        let tasks_dir = repo_root.path().join("tasks");
        write_unit(&tasks_dir, "01-setup");

        let fake_git = repo_root.path().join("fake-git.sh");
        write_executable(
            &fake_git,
            "case \"$1 $2\" in\n  \"worktree add\") mkdir -p \"$5\" ;;\nesac\nexit 0",
        );
        let _git_guard = EnvGuard::set("RALPH_GIT_BIN", fake_git.to_str().unwrap());

        let fake_agent = repo_root.path().join("fake-agent.sh");
        write_executable(&fake_agent, "cat > /dev/null; echo ok");

        let mut config = Config::default();
        config.parallelism = 1;
        config.claude.command = fake_agent.to_string_lossy().into_owned();
        config.worktree.base_path = PathBuf::from("worktrees");
        config.github.owner = RepoField::Named("acme".into());
        config.github.repo = RepoField::Named("widgets".into());

        let orchestrator = Orchestrator::new(repo_root.path(), config);
        let outcome = orchestrator.run("run-1", &tasks_dir, "agents/batch-1", true).unwrap();

        assert_eq!(outcome.run.status, RunStatus::Complete);
        assert_eq!(outcome.unit_statuses.get("01-setup"), Some(&UnitStatus::Complete));
    }

    #[test]
    #[serial]
    fn run_persists_run_and_unit_state_when_a_store_is_attached() {
        let repo_root = tempdir().unwrap();
        let tasks_dir = repo_root.path().join("tasks");
        write_unit(&tasks_dir, "01-setup");

        let fake_git = repo_root.path().join("fake-git.sh");
        write_executable(
            &fake_git,
            "case \"$1 $2\" in\n  \"worktree add\") mkdir -p \"$5\" ;;\nesac\nexit 0",
        );
        let _git_guard = EnvGuard::set("RALPH_GIT_BIN", fake_git.to_str().unwrap());

        let fake_agent = repo_root.path().join("fake-agent.sh");
        write_executable(&fake_agent, "cat > /dev/null; echo ok");

        let mut config = Config::default();
        config.parallelism = 1;
        config.claude.command = fake_agent.to_string_lossy().into_owned();
        config.worktree.base_path = PathBuf::from("worktrees");
        config.github.owner = RepoField::Named("acme".into());
        config.github.repo = RepoField::Named("widgets".into());

        let store = ralph_store::Store::open_in_memory().unwrap();
        let orchestrator = Orchestrator::new(repo_root.path(), config).with_store(store);
        let outcome = orchestrator.run("run-2", &tasks_dir, "agents/batch-1", true).unwrap();

        assert_eq!(outcome.run.status, RunStatus::Complete);
        // The run is terminal, so it must not appear in resumable_runs anymore.
        assert!(orchestrator.resumable_runs().unwrap().is_empty());
    }
}
