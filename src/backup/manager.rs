use super::deletion::{select_handler, DeletionHandler, PermanentDeleter};
use super::planner::SyncPlanner;
use super::scanner::{ScanResult, TreeScanner};
use super::task_manager::{EventSink, ExecutionPool, ExecutionReport};
use super::task_processor::BackupTaskProcessor;
use super::worker::BackupWorker;
use super::{BackupState, CancellationToken, ExcludeMatcher, RunEvent, RunSummary};
use crate::error::{ConfigError, PlanError, RunError};
use crate::utils::config::{BackupConfig, Settings};
use crate::utils::disk::{free_space, is_within, lexical_absolute, normalize, verify_destination};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Scan and plan only
    pub dry_run: bool,
    /// Overrides the configured worker count for this run
    pub max_workers: Option<usize>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Finished { summary: RunSummary },
    Stopped { summary: RunSummary },
    Failed { message: String },
}

impl RunOutcome {
    pub fn state(&self) -> BackupState {
        match self {
            Self::Finished { .. } => BackupState::Finished,
            Self::Stopped { .. } => BackupState::Stopped,
            Self::Failed { .. } => BackupState::Failed,
        }
    }

    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            Self::Finished { summary } | Self::Stopped { summary } => Some(summary),
            Self::Failed { .. } => None,
        }
    }

    fn into_event(self) -> RunEvent {
        match self {
            Self::Finished { summary } => RunEvent::Finished { summary },
            Self::Stopped { summary } => RunEvent::Stopped { summary },
            Self::Failed { message } => RunEvent::Failed { message },
        }
    }
}

struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
}

struct RunSession {
    state: BackupState,
    active: Option<ActiveRun>,
    last_outcome: Option<RunOutcome>,
}

type SharedSession = Arc<Mutex<RunSession>>;

/// Entry point for consumers. Owns at most one run at a time; every run gets
/// a fresh cancellation token, event channel and worker pool.
#[derive(Clone)]
pub struct BackupOrchestrator {
    settings: Arc<Settings>,
    session: SharedSession,
    deletion: Option<Arc<dyn DeletionHandler>>,
}

impl BackupOrchestrator {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            session: Arc::new(Mutex::new(RunSession {
                state: BackupState::Idle,
                active: None,
                last_outcome: None,
            })),
            deletion: None,
        }
    }

    /// Use `handler` for every deletion instead of choosing one from the
    /// settings at run start.
    pub fn with_deletion_handler(mut self, handler: Arc<dyn DeletionHandler>) -> Self {
        self.deletion = Some(handler);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> BackupState {
        self.session.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().active.is_some()
    }

    pub fn last_outcome(&self) -> Option<RunOutcome> {
        self.session.lock().last_outcome.clone()
    }

    /// Request the active run to stop. Returns false when nothing is running.
    pub fn stop(&self) -> bool {
        let session = self.session.lock();
        match &session.active {
            Some(run) => {
                info!("Stop requested for run {}", run.run_id);
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Validate `config` and start a run on the blocking pool of the current
    /// tokio runtime. Configuration problems are returned before anything is
    /// touched besides creating the destination directory.
    pub fn start(
        &self,
        config: BackupConfig,
        destination: Option<PathBuf>,
        options: RunOptions,
    ) -> Result<RunHandle, RunError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RunError::Environment(format!("no async runtime available: {}", e)))?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        {
            let mut session = self.session.lock();
            if session.active.is_some() {
                return Err(RunError::AlreadyRunning);
            }
            session.active = Some(ActiveRun {
                run_id: run_id.clone(),
                cancel: cancel.clone(),
            });
        }

        let guard = ActiveGuard {
            session: self.session.clone(),
            run_id: run_id.clone(),
        };
        let target = validate(&config, destination)?;
        guard.set_state(BackupState::Scanning);

        info!(
            "Starting backup '{}' (run {}) into {}",
            config.name,
            run_id,
            target.destination.display()
        );

        let (tx, rx) = mpsc::channel(self.settings.event_capacity.max(1));
        let workers = options
            .max_workers
            .filter(|n| *n > 0)
            .unwrap_or_else(|| self.settings.effective_workers());

        let run = BackupRun {
            run_id: run_id.clone(),
            config_name: config.name,
            target,
            options,
            workers,
            settings: self.settings.clone(),
            deletion: self.deletion.clone(),
            cancel: cancel.clone(),
            sink: EventSink::new(tx),
            guard,
            started: Instant::now(),
        };
        let task = runtime.spawn_blocking(move || run.run());

        Ok(RunHandle {
            run_id,
            cancel,
            events: rx,
            task,
        })
    }
}

/// Resets the session if a run ends without reporting an outcome, and on
/// validation errors.
struct ActiveGuard {
    session: SharedSession,
    run_id: String,
}

impl ActiveGuard {
    fn set_state(&self, state: BackupState) {
        self.session.lock().state = state;
    }

    fn complete(&self, outcome: RunOutcome) {
        let mut session = self.session.lock();
        session.last_outcome = Some(outcome);
        session.state = BackupState::Idle;
        session.active = None;
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut session = self.session.lock();
        let owned = session
            .active
            .as_ref()
            .map(|run| run.run_id == self.run_id)
            .unwrap_or(false);
        if owned {
            session.active = None;
            session.state = BackupState::Idle;
        }
    }
}

/// Consumer side of one run.
pub struct RunHandle {
    run_id: String,
    cancel: CancellationToken,
    events: mpsc::Receiver<RunEvent>,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn id(&self) -> &str {
        &self.run_id
    }

    pub fn stop(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next event in emission order; `None` once the run is over and every
    /// event was received.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// Split into an event stream and the task resolving to the outcome.
    pub fn into_parts(self) -> (ReceiverStream<RunEvent>, JoinHandle<RunOutcome>) {
        (ReceiverStream::new(self.events), self.task)
    }

    /// Discard remaining events and wait for the outcome.
    pub async fn wait(self) -> RunOutcome {
        self.collect().await.1
    }

    pub async fn collect(mut self) -> (Vec<RunEvent>, RunOutcome) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => RunOutcome::Failed {
                message: format!("backup run aborted: {}", e),
            },
        };
        (events, outcome)
    }
}

struct SourceRoot {
    /// Configured path made absolute; its file name is the mirror prefix
    path: PathBuf,
    name: PathBuf,
    /// Resolved path used for containment checks
    resolved: PathBuf,
}

struct RunTarget {
    sources: Vec<SourceRoot>,
    unavailable: Vec<(PathBuf, PathBuf, String)>,
    destination: PathBuf,
    matcher: ExcludeMatcher,
}

fn validate(config: &BackupConfig, destination: Option<PathBuf>) -> Result<RunTarget, ConfigError> {
    if config.sources.is_empty() {
        return Err(ConfigError::NoSources(config.name.clone()));
    }

    let mut sources: Vec<SourceRoot> = Vec::new();
    let mut unavailable = Vec::new();
    for configured in &config.sources {
        let path = lexical_absolute(configured);
        let name = match path.file_name() {
            Some(name) => PathBuf::from(name),
            None => return Err(ConfigError::UnnamedSource(configured.clone())),
        };
        let resolved = normalize(&path);
        if sources.iter().any(|s| s.resolved == resolved) {
            debug!("Ignoring duplicate source root {}", path.display());
            continue;
        }

        let readable = fs::metadata(&path).and_then(|m| {
            if m.is_dir() {
                fs::read_dir(&path).map(|_| ())
            } else {
                fs::File::open(&path).map(|_| ())
            }
        });
        match readable {
            Ok(()) => sources.push(SourceRoot {
                path,
                name,
                resolved,
            }),
            Err(e) => unavailable.push((path, name, e.to_string())),
        }
    }

    if sources.is_empty() {
        return Err(ConfigError::NoReadableSources);
    }

    let destination = destination
        .or_else(|| config.destination.clone())
        .ok_or(ConfigError::MissingDestination)?;
    let destination = verify_destination(&destination)?;

    for source in &sources {
        if is_within(&source.resolved, &destination) {
            return Err(ConfigError::SourceInsideDestination {
                source_root: source.path.clone(),
                destination,
            });
        }
    }

    let matcher = ExcludeMatcher::new(&config.excludes)?;

    Ok(RunTarget {
        sources,
        unavailable,
        destination,
        matcher,
    })
}

/// One run's context, moved onto the blocking pool.
struct BackupRun {
    run_id: String,
    config_name: String,
    target: RunTarget,
    options: RunOptions,
    workers: usize,
    settings: Arc<Settings>,
    deletion: Option<Arc<dyn DeletionHandler>>,
    cancel: CancellationToken,
    sink: EventSink,
    guard: ActiveGuard,
    started: Instant,
}

impl BackupRun {
    fn run(self) -> RunOutcome {
        let mut warnings = 0u64;
        let outcome = self.pipeline(&mut warnings);

        info!("Backup run {} ended: {:?}", self.run_id, outcome.state());
        self.transition(outcome.state());
        self.guard.complete(outcome.clone());
        self.sink.emit(outcome.clone().into_event());
        outcome
    }

    fn transition(&self, state: BackupState) {
        debug!("Run {} -> {:?}", self.run_id, state);
        self.guard.set_state(state);
        self.sink.emit(RunEvent::StateChanged { state });
    }

    fn warn(&self, warnings: &mut u64, path: Option<PathBuf>, message: String) {
        *warnings += 1;
        self.sink.emit(RunEvent::warning(path, message));
    }

    fn summary(&self, report: &ExecutionReport, warnings: u64) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            config_name: self.config_name.clone(),
            directories_created: report.directories_created,
            files_copied: report.files_copied,
            bytes_copied: report.bytes_copied,
            symlinks_created: report.symlinks_created,
            deleted: report.deleted,
            skipped: report.skipped,
            warnings: warnings + report.warnings,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    fn stopped(&self, report: &ExecutionReport, warnings: u64) -> RunOutcome {
        RunOutcome::Stopped {
            summary: self.summary(report, warnings),
        }
    }

    fn destination_missing(&self) -> Option<RunOutcome> {
        if self.target.destination.is_dir() {
            return None;
        }
        Some(RunOutcome::Failed {
            message: format!(
                "destination {} is no longer available",
                self.target.destination.display()
            ),
        })
    }

    fn pipeline(&self, warnings: &mut u64) -> RunOutcome {
        let nothing = ExecutionReport::default();
        let destination = &self.target.destination;

        self.transition(BackupState::Scanning);
        for (path, name, error) in &self.target.unavailable {
            self.warn(
                warnings,
                Some(path.clone()),
                format!(
                    "source root {} is unavailable ({}); its mirror {} is kept as is",
                    path.display(),
                    error,
                    name.display()
                ),
            );
        }

        let source_scans: Vec<ScanResult> = self
            .target
            .sources
            .par_iter()
            .map(|source| {
                let mut scanner =
                    TreeScanner::new(&self.target.matcher).with_cancel(self.cancel.clone());
                if let Ok(inner) = destination.strip_prefix(&source.resolved) {
                    scanner = scanner.prune(source.path.join(inner));
                }
                scanner.scan_source(&source.path)
            })
            .collect();
        let no_excludes = ExcludeMatcher::empty();
        let dest_scan = TreeScanner::new(&no_excludes)
            .with_cancel(self.cancel.clone())
            .scan_destination(destination);

        if self.cancel.is_cancelled()
            || dest_scan.cancelled
            || source_scans.iter().any(|s| s.cancelled)
        {
            return self.stopped(&nothing, *warnings);
        }
        if let Some(failed) = self.destination_missing() {
            return failed;
        }

        let mut planner = SyncPlanner::new().with_cancel(self.cancel.clone());
        for (_, name, _) in &self.target.unavailable {
            planner = planner.preserve(name.clone());
        }
        let mut inventories = Vec::with_capacity(source_scans.len());
        for scan in source_scans.into_iter().chain(std::iter::once(dest_scan)) {
            for error in &scan.warnings {
                self.warn(warnings, Some(error.path.clone()), error.to_string());
            }
            for key in scan.incomplete {
                planner = planner.preserve(key);
            }
            inventories.push(scan.inventory);
        }
        let dest_inventory = match inventories.pop() {
            Some(inventory) => inventory,
            None => {
                return RunOutcome::Failed {
                    message: "destination scan produced no inventory".to_string(),
                }
            }
        };

        self.transition(BackupState::Planning);
        let output = match planner.plan(&inventories, &dest_inventory) {
            Ok(output) => output,
            Err(_) => return self.stopped(&nothing, *warnings),
        };
        for collision in &output.collisions {
            let PlanError::Collision { path, .. } = collision;
            self.warn(warnings, Some(path.clone()), collision.to_string());
        }

        let plan = output.plan;
        let summary = plan.summary();
        self.sink.emit(RunEvent::Planned { summary });

        if summary.copy_bytes > 0 {
            match free_space(destination) {
                Ok(free) if free < summary.copy_bytes => self.warn(
                    warnings,
                    Some(destination.clone()),
                    format!(
                        "plan copies {} bytes but only {} bytes are free at {}",
                        summary.copy_bytes,
                        free,
                        destination.display()
                    ),
                ),
                Ok(_) => {}
                Err(e) => debug!("Free space unknown for {}: {}", destination.display(), e),
            }
        }

        if self.options.dry_run {
            info!("Dry run: {} changes planned, nothing executed", summary.changes());
            return RunOutcome::Finished {
                summary: self.summary(&nothing, *warnings),
            };
        }
        if self.cancel.is_cancelled() {
            return self.stopped(&nothing, *warnings);
        }

        self.remove_artifacts(&dest_inventory.artifacts, warnings);

        let handler: Arc<dyn DeletionHandler> = match &self.deletion {
            Some(handler) => handler.clone(),
            None if summary.deletes > 0 => {
                let (handler, notice) =
                    select_handler(
                        self.settings.deletion,
                        self.settings.trash_dir.as_deref(),
                        destination,
                    );
                if let Some(message) = notice {
                    self.sink.emit(RunEvent::Info { message });
                }
                handler
            }
            None => Arc::new(PermanentDeleter),
        };

        if let Some(failed) = self.destination_missing() {
            return failed;
        }

        self.transition(BackupState::Executing);
        let worker = BackupWorker::new(self.settings.fsync).confined_to(destination.clone());
        let processor = BackupTaskProcessor::new(worker, handler);
        let pool = ExecutionPool::new(self.workers, Arc::new(processor));
        info!("Executing {} actions with {} workers", plan.len(), pool.max_workers());
        let report = pool.execute(&plan, &self.cancel, &self.sink);

        if let Some(failed) = self.destination_missing() {
            return failed;
        }
        if report.cancelled {
            return self.stopped(&report, *warnings);
        }
        RunOutcome::Finished {
            summary: self.summary(&report, *warnings),
        }
    }

    fn remove_artifacts(&self, artifacts: &[PathBuf], warnings: &mut u64) {
        if artifacts.is_empty() {
            return;
        }
        let mut removed = 0usize;
        for path in artifacts {
            match fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    self.warn(
                        warnings,
                        Some(path.clone()),
                        format!("cannot remove stale partial file: {}", e),
                    );
                }
            }
        }
        self.sink.emit(RunEvent::Info {
            message: format!("Removed {} stale partial files from an earlier run", removed),
        });
    }
}
