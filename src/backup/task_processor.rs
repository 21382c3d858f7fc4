use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::deletion::{DeleteOutcome, DeletionHandler};
use super::planner::{Action, SkipReason};
use super::worker::BackupWorker;
use super::RunEvent;
use crate::error::ActionError;

/// What a single processed action did to the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    DirectoryCreated,
    Copied { bytes: u64 },
    SymlinkCreated { target: PathBuf },
    Deleted { reversible: bool },
    /// The entry to delete was no longer there.
    AlreadyGone,
    Skipped(SkipReason),
}

impl ActionOutcome {
    /// Event reported for this outcome, keyed by the mirror-relative path.
    pub fn to_event(&self, relative: &Path) -> RunEvent {
        let path = relative.to_path_buf();
        match self {
            Self::DirectoryCreated => RunEvent::DirectoryCreated { path },
            Self::Copied { bytes } => RunEvent::Copied {
                path,
                bytes: *bytes,
            },
            Self::SymlinkCreated { target } => RunEvent::SymlinkCreated {
                path,
                target: target.clone(),
            },
            Self::Deleted { reversible } => RunEvent::Deleted {
                path,
                reversible: *reversible,
            },
            Self::AlreadyGone => RunEvent::Info {
                message: format!("{} was already gone", relative.display()),
            },
            Self::Skipped(reason) => RunEvent::Skipped {
                path,
                reason: *reason,
            },
        }
    }
}

/// Seam between the execution pool and the filesystem. The pool owns
/// ordering and cancellation; a processor only carries out one action.
pub trait TaskProcessor: Send + Sync {
    fn process_action(&self, worker_id: usize, action: &Action) -> Result<ActionOutcome, ActionError>;

    /// Called once per successfully created directory after all transfers,
    /// deepest first.
    fn finalize_directory(&self, _action: &Action) -> Result<(), ActionError> {
        Ok(())
    }

    /// Make an existing destination directory writable before entries are
    /// added to or removed from it. Returns the mode to put back afterwards.
    fn unlock_directory(&self, _dir: &Path) -> Result<Option<u32>, ActionError> {
        Ok(None)
    }

    fn restore_directory(&self, _dir: &Path, _mode: u32) -> Result<(), ActionError> {
        Ok(())
    }
}

/// Default processor: raw copy/link operations through [`BackupWorker`] and
/// removals through the run's [`DeletionHandler`].
pub struct BackupTaskProcessor {
    worker: BackupWorker,
    deletion: Arc<dyn DeletionHandler>,
}

impl BackupTaskProcessor {
    pub fn new(worker: BackupWorker, deletion: Arc<dyn DeletionHandler>) -> Self {
        Self { worker, deletion }
    }
}

impl TaskProcessor for BackupTaskProcessor {
    fn process_action(&self, worker_id: usize, action: &Action) -> Result<ActionOutcome, ActionError> {
        debug!("Worker {} processing {}", worker_id, action.relative().display());

        match action {
            Action::Skip { reason, .. } => Ok(ActionOutcome::Skipped(*reason)),
            Action::CreateDir { dest, .. } => {
                self.worker.create_directory(dest)?;
                Ok(ActionOutcome::DirectoryCreated)
            }
            Action::CopyFile {
                source,
                dest,
                overwrite,
                ..
            } => {
                if *overwrite {
                    debug!("Replacing changed file {}", dest.display());
                }
                let bytes = self.worker.copy_file(source, dest)?;
                Ok(ActionOutcome::Copied { bytes })
            }
            Action::RecreateSymlink { source, dest, .. } => {
                let target = self.worker.recreate_symlink(source, dest)?;
                Ok(ActionOutcome::SymlinkCreated { target })
            }
            Action::Delete { dest, kind, .. } => match self.deletion.delete(dest, *kind)? {
                DeleteOutcome::AlreadyGone => Ok(ActionOutcome::AlreadyGone),
                outcome => Ok(ActionOutcome::Deleted {
                    reversible: outcome.is_reversible(),
                }),
            },
        }
    }

    fn finalize_directory(&self, action: &Action) -> Result<(), ActionError> {
        if let Action::CreateDir { source, dest, .. } = action {
            self.worker.finalize_directory(source, dest)?;
        }
        Ok(())
    }

    fn unlock_directory(&self, dir: &Path) -> Result<Option<u32>, ActionError> {
        Ok(self.worker.unlock_directory(dir)?)
    }

    fn restore_directory(&self, dir: &Path, mode: u32) -> Result<(), ActionError> {
        Ok(self.worker.restore_directory(dir, mode)?)
    }
}
