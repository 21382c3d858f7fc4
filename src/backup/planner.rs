use super::{CancellationToken, Entry, EntryKind, IdentityComparator, Inventory, PARTIAL_PREFIX};
use crate::error::{Cancelled, PlanError};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry as MapEntry;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Identical,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identical => write!(f, "identical"),
        }
    }
}

/// One step of a sync plan. `relative` is the mirror namespace key and `dest`
/// the absolute destination path; no action ever points into a source tree
/// as its target.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CreateDir {
        relative: PathBuf,
        source: Entry,
        dest: PathBuf,
    },
    CopyFile {
        relative: PathBuf,
        source: Entry,
        dest: PathBuf,
        overwrite: bool,
    },
    RecreateSymlink {
        relative: PathBuf,
        source: Entry,
        dest: PathBuf,
    },
    Delete {
        relative: PathBuf,
        dest: PathBuf,
        kind: EntryKind,
    },
    Skip {
        relative: PathBuf,
        reason: SkipReason,
    },
}

impl Action {
    pub fn relative(&self) -> &Path {
        match self {
            Action::CreateDir { relative, .. }
            | Action::CopyFile { relative, .. }
            | Action::RecreateSymlink { relative, .. }
            | Action::Delete { relative, .. }
            | Action::Skip { relative, .. } => relative,
        }
    }

    pub fn dest(&self) -> Option<&Path> {
        match self {
            Action::CreateDir { dest, .. }
            | Action::CopyFile { dest, .. }
            | Action::RecreateSymlink { dest, .. }
            | Action::Delete { dest, .. } => Some(dest),
            Action::Skip { .. } => None,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Action::Skip { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanSummary {
    pub create_dirs: usize,
    pub copies: usize,
    pub copy_bytes: u64,
    pub symlinks: usize,
    pub deletes: usize,
    pub skips: usize,
}

impl PlanSummary {
    pub fn total_actions(&self) -> usize {
        self.create_dirs + self.copies + self.symlinks + self.deletes + self.skips
    }

    /// Actions that mutate the destination.
    pub fn changes(&self) -> usize {
        self.create_dirs + self.copies + self.symlinks + self.deletes
    }
}

/// Ordered, immutable list of actions computed once per run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    actions: Vec<Action>,
}

impl SyncPlan {
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Action> {
        self.actions.iter()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match action {
                Action::CreateDir { .. } => summary.create_dirs += 1,
                Action::CopyFile { source, .. } => {
                    summary.copies += 1;
                    summary.copy_bytes += source.size;
                }
                Action::RecreateSymlink { .. } => summary.symlinks += 1,
                Action::Delete { .. } => summary.deletes += 1,
                Action::Skip { .. } => summary.skips += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanOutput {
    pub plan: SyncPlan,
    pub collisions: Vec<PlanError>,
}

/// Pure merge of source inventories against the destination inventory.
#[derive(Debug, Default)]
pub struct SyncPlanner {
    comparator: IdentityComparator,
    preserved: Vec<PathBuf>,
    cancel_flag: Option<CancellationToken>,
}

impl SyncPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel_flag = Some(token);
        self
    }

    /// Destination keys at or beneath `relative` are never deleted.
    pub fn preserve(mut self, relative: impl Into<PathBuf>) -> Self {
        self.preserved.push(relative.into());
        self
    }

    fn check_cancelled(&self) -> Result<(), Cancelled> {
        match &self.cancel_flag {
            Some(token) => token.check(),
            None => Ok(()),
        }
    }

    fn is_preserved(&self, relative: &Path) -> bool {
        self.preserved.iter().any(|p| relative.starts_with(p))
    }

    /// Build the plan. Deletions come first, deepest paths first; source
    /// actions follow in path order, so every directory precedes its
    /// children. Path collisions keep the entry from the earliest source.
    pub fn plan(&self, sources: &[Inventory], dest: &Inventory) -> Result<PlanOutput, Cancelled> {
        let mut collisions = Vec::new();
        let mut union: BTreeMap<&Path, &Entry> = BTreeMap::new();

        for inventory in sources {
            self.check_cancelled()?;
            for (relative, entry) in &inventory.entries {
                match union.entry(relative.as_path()) {
                    MapEntry::Vacant(slot) => {
                        slot.insert(entry);
                    }
                    MapEntry::Occupied(slot) => {
                        let kept = *slot.get();
                        if kept.is_dir() && entry.is_dir() {
                            continue;
                        }
                        let collision = PlanError::Collision {
                            path: relative.clone(),
                            kept: kept.path.clone(),
                            ignored: entry.path.clone(),
                        };
                        warn!("{}", collision);
                        collisions.push(collision);
                    }
                }
            }
        }

        let mut deletes = Vec::new();
        let mut actions = Vec::new();

        for (&relative, &source) in &union {
            self.check_cancelled()?;
            let dest_path = dest.root.join(relative);

            match dest.get(relative) {
                Some(existing) if self.comparator.identical(source, existing) => {
                    debug!("Skipping identical {}", relative.display());
                    actions.push(Action::Skip {
                        relative: relative.to_path_buf(),
                        reason: SkipReason::Identical,
                    });
                }
                Some(existing) if existing.kind != source.kind => {
                    deletes.push(Action::Delete {
                        relative: relative.to_path_buf(),
                        dest: dest_path.clone(),
                        kind: existing.kind,
                    });
                    actions.push(create_action(relative, source, dest_path, false));
                }
                Some(_) => actions.push(create_action(relative, source, dest_path, true)),
                None => actions.push(create_action(relative, source, dest_path, false)),
            }
        }

        for (relative, existing) in &dest.entries {
            self.check_cancelled()?;
            if union.contains_key(relative.as_path()) || self.is_preserved(relative) {
                continue;
            }
            if is_partial(relative) {
                continue;
            }
            deletes.push(Action::Delete {
                relative: relative.clone(),
                dest: dest.root.join(relative),
                kind: existing.kind,
            });
        }

        deletes.sort_by(|a, b| {
            let (a, b) = (a.relative(), b.relative());
            b.components()
                .count()
                .cmp(&a.components().count())
                .then_with(|| a.cmp(b))
        });

        deletes.extend(actions);
        let plan = SyncPlan { actions: deletes };

        let summary = plan.summary();
        info!(
            "Plan ready: {} dirs, {} copies ({} bytes), {} symlinks, {} deletes, {} skips",
            summary.create_dirs,
            summary.copies,
            summary.copy_bytes,
            summary.symlinks,
            summary.deletes,
            summary.skips
        );

        Ok(PlanOutput { plan, collisions })
    }
}

fn create_action(relative: &Path, source: &Entry, dest: PathBuf, overwrite: bool) -> Action {
    let relative = relative.to_path_buf();
    let source = source.clone();
    match source.kind {
        EntryKind::Directory => Action::CreateDir {
            relative,
            source,
            dest,
        },
        EntryKind::File => Action::CopyFile {
            relative,
            source,
            dest,
            overwrite,
        },
        EntryKind::Symlink => Action::RecreateSymlink {
            relative,
            source,
            dest,
        },
    }
}

fn is_partial(relative: &Path) -> bool {
    relative
        .file_name()
        .map(|n| n.to_string_lossy().starts_with(PARTIAL_PREFIX))
        .unwrap_or(false)
}
