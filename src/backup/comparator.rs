use super::{Entry, EntryKind};

/// Metadata identity policy used to skip redundant copies.
///
/// Files are identical when size, modification time (whole seconds) and
/// permission bits all match. Symlinks compare their target string and
/// directories only need to exist. Content is never read, so this is a
/// heuristic rather than a byte-for-byte guarantee.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityComparator;

impl IdentityComparator {
    pub fn new() -> Self {
        Self
    }

    pub fn identical(&self, source: &Entry, dest: &Entry) -> bool {
        if source.kind != dest.kind {
            return false;
        }

        match source.kind {
            EntryKind::Directory => true,
            EntryKind::Symlink => source.target == dest.target,
            EntryKind::File => {
                if source.size != dest.size {
                    tracing::debug!(
                        "Size differs for {:?} (src={}, dst={})",
                        source.path,
                        source.size,
                        dest.size
                    );
                    return false;
                }
                source.modified.unix_seconds() == dest.modified.unix_seconds()
                    && source.mode == dest.mode
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::path::PathBuf;

    fn file(size: u64, secs: i64, nanos: u32, mode: u32) -> Entry {
        Entry {
            path: PathBuf::from("/src/a.txt"),
            kind: EntryKind::File,
            size,
            modified: FileTime::from_unix_time(secs, nanos),
            mode,
            target: None,
        }
    }

    fn link(target: &str) -> Entry {
        Entry {
            path: PathBuf::from("/src/link"),
            kind: EntryKind::Symlink,
            size: target.len() as u64,
            modified: FileTime::from_unix_time(1_700_000_000, 0),
            mode: 0o777,
            target: Some(PathBuf::from(target)),
        }
    }

    #[test]
    fn test_files_identical_on_matching_metadata() {
        let cmp = IdentityComparator::new();
        let a = file(10, 1_700_000_000, 0, 0o644);
        // Sub-second differences are ignored
        let b = file(10, 1_700_000_000, 999_000_000, 0o644);
        assert!(cmp.identical(&a, &b));
    }

    #[test]
    fn test_files_differ_on_any_metadata_field() {
        let cmp = IdentityComparator::new();
        let a = file(10, 1_700_000_000, 0, 0o644);
        assert!(!cmp.identical(&a, &file(11, 1_700_000_000, 0, 0o644)));
        assert!(!cmp.identical(&a, &file(10, 1_700_000_001, 0, 0o644)));
        assert!(!cmp.identical(&a, &file(10, 1_700_000_000, 0, 0o600)));
    }

    #[test]
    fn test_symlinks_compare_targets() {
        let cmp = IdentityComparator::new();
        assert!(cmp.identical(&link("../shared"), &link("../shared")));
        assert!(!cmp.identical(&link("../shared"), &link("/abs/shared")));
    }

    #[test]
    fn test_directories_always_identical_and_kinds_must_match() {
        let cmp = IdentityComparator::new();
        let mut dir_a = file(4096, 1, 0, 0o755);
        dir_a.kind = EntryKind::Directory;
        let mut dir_b = file(0, 2, 0, 0o700);
        dir_b.kind = EntryKind::Directory;
        assert!(cmp.identical(&dir_a, &dir_b));
        assert!(!cmp.identical(&dir_a, &file(4096, 1, 0, 0o755)));
    }
}
