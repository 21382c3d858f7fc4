pub mod cancel;
pub mod comparator;
pub mod deletion;
pub mod exclude;
pub mod manager;
pub mod planner;
pub mod scanner;
pub mod task_manager;
pub mod task_processor;
pub mod worker;

pub use cancel::CancellationToken;
pub use comparator::IdentityComparator;
pub use deletion::{DeletionHandler, DeletionMode, PermanentDeleter, TrashDeleter};
pub use exclude::ExcludeMatcher;
pub use manager::{BackupOrchestrator, RunHandle, RunOptions, RunOutcome};
pub use planner::{Action, PlanSummary, SkipReason, SyncPlan, SyncPlanner};
pub use scanner::TreeScanner;
pub use task_manager::{EventSink, ExecutionPool, ExecutionReport};
pub use task_processor::{ActionOutcome, BackupTaskProcessor, TaskProcessor};
pub use worker::BackupWorker;

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name prefix of files staged in the destination before being renamed into
/// place. Entries carrying it are leftovers of an interrupted run.
pub const PARTIAL_PREFIX: &str = ".backup-partial-";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One scanned filesystem entry. Built fresh on every scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: FileTime,
    /// Permission bits (`mode & 0o7777`).
    pub mode: u32,
    pub target: Option<PathBuf>,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Entries of one scanned root keyed by their path relative to the mirror
/// namespace. Source inventories are prefixed with the root's basename,
/// destination inventories are relative to the destination root.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub root: PathBuf,
    pub entries: BTreeMap<PathBuf, Entry>,
    /// Stale staging files found in a destination scan.
    pub artifacts: Vec<PathBuf>,
}

impl Inventory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: BTreeMap::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn get(&self, relative: &Path) -> Option<&Entry> {
        self.entries.get(relative)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, relative: PathBuf, entry: Entry) {
        self.entries.insert(relative, entry);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupState {
    Idle,
    Scanning,
    Planning,
    Executing,
    Finished,
    Stopped,
    Failed,
}

impl BackupState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Scanning | Self::Planning | Self::Executing)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub config_name: String,
    pub directories_created: u64,
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub symlinks_created: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub warnings: u64,
    pub elapsed_ms: u64,
}

/// Everything the engine reports to its consumers. Events from different
/// workers interleave; per-file order is preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StateChanged { state: BackupState },
    Info { message: String },
    Planned { summary: PlanSummary },
    DirectoryCreated { path: PathBuf },
    Copied { path: PathBuf, bytes: u64 },
    SymlinkCreated { path: PathBuf, target: PathBuf },
    Skipped { path: PathBuf, reason: SkipReason },
    Deleted { path: PathBuf, reversible: bool },
    Warning { path: Option<PathBuf>, message: String },
    Progress { completed: usize, total: usize },
    Finished { summary: RunSummary },
    Stopped { summary: RunSummary },
    Failed { message: String },
}

impl RunEvent {
    pub fn warning(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self::Warning {
            path,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. } | Self::Stopped { .. } | Self::Failed { .. }
        )
    }
}
