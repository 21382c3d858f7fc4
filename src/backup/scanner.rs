use super::{CancellationToken, Entry, EntryKind, ExcludeMatcher, Inventory, PARTIAL_PREFIX};
use crate::error::ScanError;
use filetime::FileTime;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Result of walking one root.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub inventory: Inventory,
    pub warnings: Vec<ScanError>,
    /// Namespace keys whose contents could not be fully read. Destination
    /// entries beneath them must not be deleted.
    pub incomplete: Vec<PathBuf>,
    pub excluded: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Namespace {
    /// Keys are prefixed with the root's basename and include the root.
    Source,
    /// Keys are relative to the root, which itself is left out.
    Destination,
}

/// Depth-first walker producing a flat inventory. Symlinks are recorded, never
/// followed, and excluded directories are pruned without descending.
pub struct TreeScanner<'a> {
    matcher: &'a ExcludeMatcher,
    pruned: Vec<PathBuf>,
    cancel_flag: Option<CancellationToken>,
}

impl<'a> TreeScanner<'a> {
    pub fn new(matcher: &'a ExcludeMatcher) -> Self {
        Self {
            matcher,
            pruned: Vec::new(),
            cancel_flag: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel_flag = Some(token);
        self
    }

    /// Never descend into `path` (absolute). Used to keep a destination that
    /// lives inside a source root out of that root's scan.
    pub fn prune(mut self, path: impl Into<PathBuf>) -> Self {
        self.pruned.push(path.into());
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    pub fn scan_source(&self, root: &Path) -> ScanResult {
        self.walk(root, Namespace::Source)
    }

    pub fn scan_destination(&self, root: &Path) -> ScanResult {
        self.walk(root, Namespace::Destination)
    }

    fn walk(&self, root: &Path, namespace: Namespace) -> ScanResult {
        info!("Scanning {}", root.display());

        let prefix = match namespace {
            Namespace::Source => root.file_name().map(PathBuf::from).unwrap_or_default(),
            Namespace::Destination => PathBuf::new(),
        };
        let key_for = |path: &Path| -> PathBuf {
            match path.strip_prefix(root) {
                Ok(rel) if rel.as_os_str().is_empty() => prefix.clone(),
                Ok(rel) => prefix.join(rel),
                Err(_) => prefix.join(path),
            }
        };

        let mut result = ScanResult {
            inventory: Inventory::new(root),
            ..Default::default()
        };
        let mut excluded = 0usize;

        let min_depth = match namespace {
            Namespace::Source => 0,
            Namespace::Destination => 1,
        };

        let walker = WalkDir::new(root)
            .follow_links(false)
            .min_depth(min_depth)
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 {
                    return true;
                }
                if self.pruned.iter().any(|p| p == e.path()) {
                    debug!("Pruning {}", e.path().display());
                    return false;
                }
                let rel = e.path().strip_prefix(root).unwrap_or(e.path());
                if self
                    .matcher
                    .is_entry_excluded(rel, e.path(), e.file_type().is_dir())
                {
                    debug!("Excluding {}", e.path().display());
                    excluded += 1;
                    return false;
                }
                true
            });

        for item in walker {
            if self.is_cancelled() {
                result.cancelled = true;
                break;
            }

            let dir_entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| root.to_path_buf());
                    warn!("Cannot scan {}: {}", path.display(), err);
                    result.incomplete.push(key_for(&path));
                    result.warnings.push(ScanError {
                        path,
                        source: err.into(),
                    });
                    continue;
                }
            };

            let path = dir_entry.path();
            let staging_name = dir_entry.depth() > 0
                && !dir_entry.file_type().is_dir()
                && dir_entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(PARTIAL_PREFIX);
            if staging_name {
                match namespace {
                    Namespace::Destination => {
                        debug!("Found stale partial {}", path.display());
                        result.inventory.artifacts.push(path.to_path_buf());
                    }
                    Namespace::Source => {
                        let err = ScanError::reserved(path.to_path_buf());
                        warn!("{}", err);
                        result.warnings.push(err);
                    }
                }
                continue;
            }

            match read_entry(&dir_entry) {
                Ok(entry) => {
                    result.inventory.insert(key_for(path), entry);
                }
                Err(err) => {
                    warn!("{}", err);
                    result.incomplete.push(key_for(path));
                    result.warnings.push(err);
                }
            }
        }

        result.excluded = excluded;
        info!(
            "Scan of {} complete: {} entries, {} excluded, {} warnings",
            root.display(),
            result.inventory.len(),
            result.excluded,
            result.warnings.len()
        );
        result
    }
}

/// The root itself is described by what it points to: a symlinked source
/// root is mirrored as the directory or file it resolves to.
fn read_entry(dir_entry: &walkdir::DirEntry) -> Result<Entry, ScanError> {
    let path = dir_entry.path().to_path_buf();
    let metadata = if dir_entry.depth() == 0 {
        fs::metadata(&path)
    } else {
        dir_entry.metadata().map_err(io::Error::from)
    };
    let metadata = match metadata {
        Ok(m) => m,
        Err(source) => return Err(ScanError { path, source }),
    };

    let file_type = metadata.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        return Err(ScanError::unsupported(path));
    };

    let target = if kind == EntryKind::Symlink {
        match fs::read_link(&path) {
            Ok(target) => Some(target),
            Err(source) => return Err(ScanError { path, source }),
        }
    } else {
        None
    };

    Ok(Entry {
        kind,
        size: metadata.len(),
        modified: FileTime::from_last_modification_time(&metadata),
        mode: metadata.permissions().mode() & 0o7777,
        target,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("a");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("keep.txt"), b"0123456789").unwrap();
        fs::write(root.join("tmp.log"), b"log").unwrap();
        fs::write(root.join("sub/inner.txt"), b"inner").unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), b"js").unwrap();
        symlink("sub", root.join("link")).unwrap();
        tmp
    }

    #[test]
    fn test_source_scan_prefixes_basename() {
        let tmp = tree();
        let matcher = ExcludeMatcher::empty();
        let result = TreeScanner::new(&matcher).scan_source(&tmp.path().join("a"));

        let inv = &result.inventory;
        assert!(result.warnings.is_empty());
        assert_eq!(inv.get(Path::new("a")).unwrap().kind, EntryKind::Directory);
        let keep = inv.get(Path::new("a/keep.txt")).unwrap();
        assert_eq!(keep.kind, EntryKind::File);
        assert_eq!(keep.size, 10);
        assert!(inv.get(Path::new("a/sub/inner.txt")).is_some());
        assert!(inv.get(Path::new("a/node_modules/pkg/index.js")).is_some());
    }

    #[test]
    fn test_symlinks_recorded_not_followed() {
        let tmp = tree();
        let matcher = ExcludeMatcher::empty();
        let result = TreeScanner::new(&matcher).scan_source(&tmp.path().join("a"));

        let link = result.inventory.get(Path::new("a/link")).unwrap();
        assert_eq!(link.kind, EntryKind::Symlink);
        assert_eq!(link.target.as_deref(), Some(Path::new("sub")));
        assert!(result.inventory.get(Path::new("a/link/inner.txt")).is_none());
    }

    #[test]
    fn test_excludes_prune_subtrees() {
        let tmp = tree();
        let matcher = ExcludeMatcher::new(["*.log", "node_modules/*"]).unwrap();
        let result = TreeScanner::new(&matcher).scan_source(&tmp.path().join("a"));

        let inv = &result.inventory;
        assert!(inv.get(Path::new("a/tmp.log")).is_none());
        assert!(inv.get(Path::new("a/node_modules")).is_none());
        assert!(inv.get(Path::new("a/node_modules/pkg/index.js")).is_none());
        assert!(inv.get(Path::new("a/keep.txt")).is_some());
        assert_eq!(result.excluded, 2);
    }

    #[test]
    fn test_destination_scan_skips_root_and_collects_artifacts() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("a")).unwrap();
        fs::write(tmp.path().join("a/file"), b"x").unwrap();
        let partial = tmp.path().join(format!("a/{}abc", PARTIAL_PREFIX));
        fs::write(&partial, b"half").unwrap();

        let matcher = ExcludeMatcher::empty();
        let result = TreeScanner::new(&matcher).scan_destination(tmp.path());

        assert_eq!(result.inventory.len(), 2);
        assert!(result.inventory.get(Path::new("a")).is_some());
        assert!(result.inventory.get(Path::new("a/file")).is_some());
        assert_eq!(result.inventory.artifacts, vec![partial]);
    }

    #[test]
    fn test_pruned_path_not_scanned() {
        let tmp = tree();
        let matcher = ExcludeMatcher::empty();
        let root = tmp.path().join("a");
        let result = TreeScanner::new(&matcher)
            .prune(root.join("sub"))
            .scan_source(&root);
        assert!(result.inventory.get(Path::new("a/sub")).is_none());
        assert!(result.inventory.get(Path::new("a/keep.txt")).is_some());
    }

    #[test]
    fn test_cancelled_scan_stops_early() {
        let tmp = tree();
        let matcher = ExcludeMatcher::empty();
        let token = CancellationToken::new();
        token.cancel();
        let result = TreeScanner::new(&matcher)
            .with_cancel(token)
            .scan_source(&tmp.path().join("a"));
        assert!(result.cancelled);
        assert!(result.inventory.is_empty());
    }

    #[test]
    fn test_symlinked_root_scanned_as_directory() {
        let tmp = tree();
        let link = tmp.path().join("docs");
        symlink(tmp.path().join("a"), &link).unwrap();

        let matcher = ExcludeMatcher::empty();
        let result = TreeScanner::new(&matcher).scan_source(&link);

        let root = result.inventory.get(Path::new("docs")).unwrap();
        assert_eq!(root.kind, EntryKind::Directory);
        assert!(root.target.is_none());
        assert_eq!(
            result.inventory.get(Path::new("docs/keep.txt")).unwrap().kind,
            EntryKind::File
        );
        // Links below the root are still recorded as links
        assert_eq!(
            result.inventory.get(Path::new("docs/link")).unwrap().kind,
            EntryKind::Symlink
        );
    }

    #[test]
    fn test_socket_is_warning_without_entry() {
        let tmp = tree();
        let socket = tmp.path().join("a/agent.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();

        let matcher = ExcludeMatcher::empty();
        let result = TreeScanner::new(&matcher).scan_source(&tmp.path().join("a"));

        assert!(result.inventory.get(Path::new("a/agent.sock")).is_none());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].path, socket);
        assert_eq!(result.warnings[0].source.kind(), io::ErrorKind::Unsupported);
        assert!(result.inventory.get(Path::new("a/keep.txt")).is_some());
    }

    #[test]
    fn test_source_file_with_staging_prefix_is_skipped() {
        let tmp = tree();
        let odd = tmp.path().join(format!("a/{}notes", PARTIAL_PREFIX));
        fs::write(&odd, b"x").unwrap();

        let matcher = ExcludeMatcher::empty();
        let result = TreeScanner::new(&matcher).scan_source(&tmp.path().join("a"));

        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].path, odd);
        assert!(result.incomplete.is_empty());
        assert!(result.inventory.artifacts.is_empty());
        assert_eq!(
            result
                .inventory
                .entries
                .keys()
                .filter(|k| k.to_string_lossy().contains(PARTIAL_PREFIX))
                .count(),
            0
        );
    }

    #[test]
    fn test_unreadable_directory_is_warning() {
        if rustix::process::geteuid().is_root() {
            eprintln!(
                "skipping test_unreadable_directory_is_warning: permission bits do not restrict root"
            );
            return;
        }
        let tmp = tree();
        let locked = tmp.path().join("a/sub");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let matcher = ExcludeMatcher::empty();
        let result = TreeScanner::new(&matcher).scan_source(&tmp.path().join("a"));
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.incomplete, vec![PathBuf::from("a/sub")]);
        assert!(result.inventory.get(Path::new("a/keep.txt")).is_some());
    }
}
