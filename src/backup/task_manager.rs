use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::planner::{Action, SyncPlan};
use super::task_processor::{ActionOutcome, TaskProcessor};
use super::{CancellationToken, EntryKind, RunEvent};
use crate::error::ActionError;

/// Producer side of a run's bounded event channel. Cloned into every worker.
/// A full channel blocks the sender, so a slow consumer throttles the run.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<RunEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<RunEvent>) -> Self {
        Self { tx }
    }

    /// Must be called from a blocking context (worker thread or
    /// `spawn_blocking`), never from inside an async task.
    pub fn emit(&self, event: RunEvent) {
        match &event {
            RunEvent::Warning { message, .. } => warn!("{}", message),
            RunEvent::Failed { message } => warn!("Run failed: {}", message),
            RunEvent::Info { message } => info!("{}", message),
            RunEvent::Progress { .. } => {}
            other => debug!("Event: {:?}", other),
        }
        // A dropped receiver only means nobody is listening anymore
        let _ = self.tx.blocking_send(event);
    }
}

/// Counts of what an execution actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub directories_created: u64,
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub symlinks_created: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub warnings: u64,
    pub completed: usize,
    pub cancelled: bool,
}

impl ExecutionReport {
    fn record(&mut self, outcome: &ActionOutcome) {
        match outcome {
            ActionOutcome::DirectoryCreated => self.directories_created += 1,
            ActionOutcome::Copied { bytes } => {
                self.files_copied += 1;
                self.bytes_copied += bytes;
            }
            ActionOutcome::SymlinkCreated { .. } => self.symlinks_created += 1,
            ActionOutcome::Deleted { .. } => self.deleted += 1,
            ActionOutcome::AlreadyGone => {}
            ActionOutcome::Skipped(_) => self.skipped += 1,
        }
    }
}

#[derive(Debug)]
enum WorkItem<'a> {
    Action(&'a Action),
    Shutdown,
}

/// Runs a [`SyncPlan`] in phases:
///
/// 1. skips (bookkeeping only)
/// 2. deletion of files and symlinks, parallel
/// 3. deletion of directories, deepest first, sequential
/// 4. directory creation, parents first, sequential
/// 5. file copies and symlinks, parallel
///
/// Existing destination directories without owner write access are opened
/// up first and get their mode back at the very end. Directories created in
/// phase 4 get their permissions and mtime applied once phase 5 is over. The
/// cancellation token is checked before every action; an action already
/// started always runs to completion.
pub struct ExecutionPool {
    max_workers: usize,
    processor: Arc<dyn TaskProcessor>,
}

struct RunContext<'a> {
    processor: &'a dyn TaskProcessor,
    cancel: &'a CancellationToken,
    sink: &'a EventSink,
    total: usize,
    progress: AtomicUsize,
    report: Mutex<ExecutionReport>,
    created_dirs: Mutex<Vec<&'a Action>>,
}

impl ExecutionPool {
    pub fn new(max_workers: usize, processor: Arc<dyn TaskProcessor>) -> Self {
        Self {
            max_workers: max_workers.max(1),
            processor,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn execute(
        &self,
        plan: &SyncPlan,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> ExecutionReport {
        info!(
            "Executing {} actions with up to {} workers",
            plan.len(),
            self.max_workers
        );

        let ctx = RunContext {
            processor: self.processor.as_ref(),
            cancel,
            sink,
            total: plan.len(),
            progress: AtomicUsize::new(0),
            report: Mutex::new(ExecutionReport::default()),
            created_dirs: Mutex::new(Vec::new()),
        };

        let actions = plan.actions();
        let skips: Vec<&Action> = actions.iter().filter(|a| a.is_skip()).collect();
        let file_deletes: Vec<&Action> = actions
            .iter()
            .filter(|a| matches!(a, Action::Delete { kind, .. } if *kind != EntryKind::Directory))
            .collect();
        let dir_deletes: Vec<&Action> = actions
            .iter()
            .filter(|a| matches!(a, Action::Delete { kind: EntryKind::Directory, .. }))
            .collect();
        let create_dirs: Vec<&Action> = actions
            .iter()
            .filter(|a| matches!(a, Action::CreateDir { .. }))
            .collect();
        let transfers: Vec<&Action> = actions
            .iter()
            .filter(|a| matches!(a, Action::CopyFile { .. } | Action::RecreateSymlink { .. }))
            .collect();

        let unlocked = if cancel.is_cancelled() {
            Vec::new()
        } else {
            ctx.open_directories(actions)
        };

        let completed_all = ctx.run_sequential(&skips)
            && self.run_parallel("delete", file_deletes, &ctx)
            && ctx.run_sequential(&dir_deletes)
            && ctx.run_sequential(&create_dirs)
            && self.run_parallel("transfer", transfers, &ctx);

        ctx.finalize_directories();
        ctx.restore_directories(&unlocked);

        let mut report = ctx.report.into_inner();
        report.completed = ctx.progress.load(Ordering::SeqCst);
        report.cancelled = !completed_all && report.completed < ctx.total;

        info!(
            "Execution {}: {}/{} actions, {} copied ({} bytes), {} deleted, {} warnings",
            if report.cancelled { "stopped" } else { "complete" },
            report.completed,
            ctx.total,
            report.files_copied,
            report.bytes_copied,
            report.deleted,
            report.warnings
        );
        report
    }

    /// Feed `actions` through a bounded queue to scoped worker threads.
    /// Returns false when cancellation cut the phase short.
    fn run_parallel<'a>(&self, phase: &str, actions: Vec<&'a Action>, ctx: &RunContext<'a>) -> bool {
        if actions.is_empty() {
            return !ctx.cancel.is_cancelled();
        }

        let num_workers = self.max_workers.min(actions.len());
        debug!("Phase {}: {} actions on {} workers", phase, actions.len(), num_workers);

        thread::scope(|scope| {
            let (work_sender, work_receiver) = bounded::<WorkItem<'a>>(num_workers * 2);

            let mut spawned = 0;
            for worker_id in 0..num_workers {
                let receiver = work_receiver.clone();
                let spawn = thread::Builder::new()
                    .name(format!("backup-worker-{}", worker_id))
                    .spawn_scoped(scope, move || worker_loop(worker_id, receiver, ctx));
                match spawn {
                    Ok(_) => spawned += 1,
                    Err(e) => warn!("Failed to start worker {}: {}", worker_id, e),
                }
            }
            drop(work_receiver);

            if spawned == 0 {
                return ctx.run_sequential(&actions);
            }

            let mut fed_all = true;
            for action in actions {
                if ctx.cancel.is_cancelled() {
                    fed_all = false;
                    break;
                }
                if work_sender.send(WorkItem::Action(action)).is_err() {
                    fed_all = false;
                    break;
                }
            }
            for _ in 0..spawned {
                let _ = work_sender.send(WorkItem::Shutdown);
            }
            fed_all
        }) && !ctx.cancel.is_cancelled()
    }
}

fn worker_loop<'a>(worker_id: usize, work_receiver: Receiver<WorkItem<'a>>, ctx: &RunContext<'a>) {
    debug!("Worker {} started", worker_id);

    loop {
        match work_receiver.recv() {
            Ok(WorkItem::Action(action)) => {
                // Queued work is dropped once a stop is requested
                if ctx.cancel.is_cancelled() {
                    continue;
                }
                ctx.run(worker_id, action);
            }
            Ok(WorkItem::Shutdown) | Err(_) => break,
        }
    }

    debug!("Worker {} finished", worker_id);
}

impl<'a> RunContext<'a> {
    fn run_sequential(&self, actions: &[&'a Action]) -> bool {
        for action in actions {
            if self.cancel.is_cancelled() {
                return false;
            }
            self.run(0, action);
        }
        true
    }

    fn run(&self, worker_id: usize, action: &'a Action) {
        match self.processor.process_action(worker_id, action) {
            Ok(outcome) => {
                self.report.lock().record(&outcome);
                if outcome == ActionOutcome::DirectoryCreated {
                    self.created_dirs.lock().push(action);
                }
                self.sink.emit(outcome.to_event(action.relative()));
            }
            Err(e) => self.warn(e),
        }

        let completed = self.progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.sink.emit(RunEvent::Progress {
            completed,
            total: self.total,
        });
    }

    fn warn(&self, error: ActionError) {
        self.report.lock().warnings += 1;
        self.sink
            .emit(RunEvent::warning(Some(error.path().to_path_buf()), error.to_string()));
    }

    /// Parents of every changed entry, plus directories about to be removed.
    fn open_directories(&self, actions: &'a [Action]) -> Vec<(&'a Path, u32)> {
        let mut targets: BTreeSet<&Path> = BTreeSet::new();
        for action in actions {
            if let Some(dest) = action.dest() {
                if let Some(parent) = dest.parent() {
                    targets.insert(parent);
                }
                if matches!(action, Action::Delete { kind: EntryKind::Directory, .. }) {
                    targets.insert(dest);
                }
            }
        }

        // Parents sort before their children
        let mut unlocked = Vec::new();
        for dir in targets {
            match self.processor.unlock_directory(dir) {
                Ok(Some(mode)) => unlocked.push((dir, mode)),
                Ok(None) => {}
                Err(e) => self.warn(e),
            }
        }
        if !unlocked.is_empty() {
            info!("Temporarily opened {} read-only directories", unlocked.len());
        }
        unlocked
    }

    fn restore_directories(&self, unlocked: &[(&Path, u32)]) {
        for (dir, mode) in unlocked.iter().rev() {
            if let Err(e) = self.processor.restore_directory(dir, *mode) {
                self.warn(e);
            }
        }
    }

    /// Runs even after a stop so directories that were created still carry
    /// their source metadata.
    fn finalize_directories(&self) {
        let created = std::mem::take(&mut *self.created_dirs.lock());
        for action in created.iter().rev() {
            if let Err(e) = self.processor.finalize_directory(action) {
                self.warn(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::deletion::PermanentDeleter;
    use crate::backup::task_processor::BackupTaskProcessor;
    use crate::backup::worker::BackupWorker;
    use crate::backup::{ExcludeMatcher, Inventory, SyncPlanner, TreeScanner};
    use crate::error::ActionError;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn plan_for(source: &Path, dest: &Path) -> SyncPlan {
        let matcher = ExcludeMatcher::empty();
        let scanner = TreeScanner::new(&matcher);
        let sources: Vec<Inventory> = vec![scanner.scan_source(source).inventory];
        let dest = scanner.scan_destination(dest).inventory;
        SyncPlanner::new().plan(&sources, &dest).unwrap().plan
    }

    fn pool(workers: usize) -> ExecutionPool {
        ExecutionPool::new(
            workers,
            Arc::new(BackupTaskProcessor::new(
                BackupWorker::default(),
                Arc::new(PermanentDeleter),
            )),
        )
    }

    fn drain(mut rx: mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn source_tree(tmp: &TempDir, files: usize) -> PathBuf {
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("deep/er")).unwrap();
        for i in 0..files {
            fs::write(src.join(format!("deep/er/f{}.txt", i)), format!("file {}", i)).unwrap();
        }
        std::os::unix::fs::symlink("deep", src.join("shortcut")).unwrap();
        src
    }

    #[test]
    fn test_parallel_execution_mirrors_tree() {
        let tmp = TempDir::new().unwrap();
        let src = source_tree(&tmp, 20);
        let dest = tmp.path().join("dest");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("stale.txt"), b"old").unwrap();

        let plan = plan_for(&src, &dest);
        let (tx, rx) = mpsc::channel(1024);
        let report = pool(4).execute(&plan, &CancellationToken::new(), &EventSink::new(tx));

        assert!(!report.cancelled);
        assert_eq!(report.files_copied, 20);
        assert_eq!(report.directories_created, 3);
        assert_eq!(report.symlinks_created, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.completed, plan.len());
        assert!(!dest.join("stale.txt").exists());
        assert_eq!(fs::read_to_string(dest.join("src/deep/er/f7.txt")).unwrap(), "file 7");
        assert_eq!(
            fs::read_link(dest.join("src/shortcut")).unwrap(),
            PathBuf::from("deep")
        );

        let events = drain(rx);
        let last_progress = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Progress { completed, total } => Some((*completed, *total)),
                _ => None,
            })
            .max();
        assert_eq!(last_progress, Some((plan.len(), plan.len())));

        // Nothing left to do afterwards
        let again = plan_for(&src, &dest);
        assert_eq!(again.summary().changes(), 0);
    }

    #[test]
    fn test_cancelled_before_start_changes_nothing() {
        let tmp = TempDir::new().unwrap();
        let src = source_tree(&tmp, 5);
        let dest = tmp.path().join("dest");
        fs::create_dir(&dest).unwrap();

        let plan = plan_for(&src, &dest);
        let token = CancellationToken::new();
        token.cancel();
        let (tx, _rx) = mpsc::channel(1024);
        let report = pool(2).execute(&plan, &token, &EventSink::new(tx));

        assert!(report.cancelled);
        assert_eq!(report.completed, 0);
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_action_is_warning_and_run_continues() {
        let tmp = TempDir::new().unwrap();
        let src = source_tree(&tmp, 5);
        let dest = tmp.path().join("dest");
        fs::create_dir(&dest).unwrap();

        let plan = plan_for(&src, &dest);
        fs::remove_file(src.join("deep/er/f2.txt")).unwrap();

        let (tx, rx) = mpsc::channel(1024);
        let report = pool(3).execute(&plan, &CancellationToken::new(), &EventSink::new(tx));

        assert!(!report.cancelled);
        assert_eq!(report.warnings, 1);
        assert_eq!(report.files_copied, 4);
        assert!(!dest.join("src/deep/er/f2.txt").exists());

        let warnings: Vec<_> = drain(rx)
            .into_iter()
            .filter(|e| matches!(e, RunEvent::Warning { .. }))
            .collect();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_read_only_destination_directory_keeps_updating() {
        use std::os::unix::fs::PermissionsExt;
        let mode_of = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o7777;
        let chmod = |p: &Path, mode: u32| fs::set_permissions(p, fs::Permissions::from_mode(mode)).unwrap();

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let ro = src.join("ro");
        fs::create_dir_all(&ro).unwrap();
        fs::write(ro.join("f.txt"), b"v1").unwrap();
        fs::write(ro.join("gone.txt"), b"bye").unwrap();
        chmod(&ro, 0o555);
        let dest = tmp.path().join("dest");
        fs::create_dir(&dest).unwrap();
        let mirrored = dest.join("src/ro");

        let (tx, _rx) = mpsc::channel(1024);
        let sink = EventSink::new(tx);
        let first = pool(2).execute(&plan_for(&src, &dest), &CancellationToken::new(), &sink);
        assert_eq!(first.warnings, 0);
        assert_eq!(mode_of(&mirrored), 0o555);

        chmod(&ro, 0o755);
        fs::write(ro.join("f.txt"), b"version 2").unwrap();
        fs::remove_file(ro.join("gone.txt")).unwrap();
        chmod(&ro, 0o555);

        let second = pool(2).execute(&plan_for(&src, &dest), &CancellationToken::new(), &sink);
        assert_eq!(second.warnings, 0);
        assert_eq!(second.files_copied, 1);
        assert_eq!(second.deleted, 1);
        assert_eq!(fs::read_to_string(mirrored.join("f.txt")).unwrap(), "version 2");
        assert!(!mirrored.join("gone.txt").exists());
        assert_eq!(mode_of(&mirrored), 0o555);

        chmod(&ro, 0o755);
        chmod(&mirrored, 0o755);
    }

    /// Records the order in which action kinds reach the processor.
    struct Recorder {
        seen: parking_lot::Mutex<Vec<&'static str>>,
    }

    impl TaskProcessor for Recorder {
        fn process_action(&self, _worker_id: usize, action: &Action) -> Result<ActionOutcome, ActionError> {
            let (label, outcome) = match action {
                Action::Skip { reason, .. } => ("skip", ActionOutcome::Skipped(*reason)),
                Action::Delete { kind: EntryKind::Directory, .. } => {
                    ("delete-dir", ActionOutcome::Deleted { reversible: false })
                }
                Action::Delete { .. } => ("delete", ActionOutcome::Deleted { reversible: false }),
                Action::CreateDir { .. } => ("mkdir", ActionOutcome::DirectoryCreated),
                Action::CopyFile { .. } => ("copy", ActionOutcome::Copied { bytes: 0 }),
                Action::RecreateSymlink { .. } => (
                    "link",
                    ActionOutcome::SymlinkCreated {
                        target: PathBuf::new(),
                    },
                ),
            };
            self.seen.lock().push(label);
            Ok(outcome)
        }
    }

    #[test]
    fn test_phases_run_in_order() {
        let tmp = TempDir::new().unwrap();
        let src = source_tree(&tmp, 3);
        fs::write(src.join("top.txt"), b"t").unwrap();
        let dest = tmp.path().join("dest");
        fs::create_dir_all(dest.join("gone/inner")).unwrap();
        fs::write(dest.join("gone/inner/x"), b"x").unwrap();
        fs::create_dir(dest.join("src")).unwrap();

        let plan = plan_for(&src, &dest);
        let recorder = Arc::new(Recorder {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let (tx, _rx) = mpsc::channel(1024);
        ExecutionPool::new(2, recorder.clone()).execute(
            &plan,
            &CancellationToken::new(),
            &EventSink::new(tx),
        );

        let rank = |label: &str| match label {
            "skip" => 0,
            "delete" => 1,
            "delete-dir" => 2,
            "mkdir" => 3,
            _ => 4,
        };
        let seen = recorder.seen.lock().clone();
        assert_eq!(seen.len(), plan.len());
        assert!(seen.windows(2).all(|w| rank(w[0]) <= rank(w[1])), "{:?}", seen);
        assert!(seen.contains(&"skip"));
        assert!(seen.contains(&"delete-dir"));
    }
}
