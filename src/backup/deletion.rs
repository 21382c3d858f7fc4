use super::EntryKind;
use crate::error::DeleteError;
use crate::utils::disk::{device_of, volume_root};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeletionMode {
    /// Trash when a holding area can be prepared, permanent otherwise
    #[default]
    Auto,
    Trash,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Trashed,
    Removed,
    AlreadyGone,
}

impl DeleteOutcome {
    pub fn is_reversible(self) -> bool {
        self == Self::Trashed
    }
}

/// Removes destination entries. Implementations decide whether the removal
/// can be undone.
pub trait DeletionHandler: Send + Sync {
    fn delete(&self, path: &Path, kind: EntryKind) -> Result<DeleteOutcome, DeleteError>;

    fn is_reversible(&self) -> bool;
}

/// Unlinks files and removes directories recursively.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermanentDeleter;

impl DeletionHandler for PermanentDeleter {
    fn delete(&self, path: &Path, kind: EntryKind) -> Result<DeleteOutcome, DeleteError> {
        debug!("Removing {:?} {}", kind, path.display());
        remove_path(path).map_err(|source| DeleteError {
            path: path.to_path_buf(),
            source,
        })
    }

    fn is_reversible(&self) -> bool {
        false
    }
}

/// Decide by what is on disk now rather than what the scan saw.
fn remove_path(path: &Path) -> io::Result<DeleteOutcome> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DeleteOutcome::AlreadyGone),
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(DeleteOutcome::Removed),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DeleteOutcome::AlreadyGone),
        Err(e) => Err(e),
    }
}

/// Moves entries into a freedesktop.org style trash directory
/// (`files/` plus `info/*.trashinfo`).
#[derive(Debug, Clone)]
pub struct TrashDeleter {
    files_dir: PathBuf,
    info_dir: PathBuf,
}

impl TrashDeleter {
    pub fn new(trash_root: impl AsRef<Path>) -> io::Result<Self> {
        let trash_root = trash_root.as_ref();
        let files_dir = trash_root.join("files");
        let info_dir = trash_root.join("info");
        fs::create_dir_all(&files_dir)?;
        fs::create_dir_all(&info_dir)?;
        Ok(Self {
            files_dir,
            info_dir,
        })
    }

    /// `$XDG_DATA_HOME/Trash`
    pub fn home_trash() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("Trash"))
    }

    /// Per-volume trash `<top>/.Trash-<uid>` of the filesystem holding
    /// `path`, so entries can be renamed into it without crossing devices.
    pub fn for_volume(path: &Path) -> io::Result<Self> {
        let top = volume_root(path)?;
        let root = top.join(format!(".Trash-{}", rustix::process::geteuid().as_raw()));
        match fs::DirBuilder::new().mode(0o700).create(&root) {
            Ok(()) => info!("Created volume trash {}", root.display()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
        if !fs::symlink_metadata(&root)?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        Self::new(root)
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    /// Claim a unique trash name by creating its info file exclusively.
    fn reserve(&self, path: &Path) -> io::Result<(PathBuf, PathBuf)> {
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        let mut attempt = 1u32;
        loop {
            let name = if attempt == 1 {
                base.clone()
            } else {
                format!("{}.{}", base, attempt)
            };
            attempt += 1;

            let target = self.files_dir.join(&name);
            if fs::symlink_metadata(&target).is_ok() {
                continue;
            }
            let info_path = self.info_dir.join(format!("{}.trashinfo", name));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&info_path)
            {
                Ok(mut file) => {
                    write!(
                        file,
                        "[Trash Info]\nPath={}\nDeletionDate={}\n",
                        encode_path(path),
                        Local::now().format("%Y-%m-%dT%H:%M:%S")
                    )?;
                    return Ok((target, info_path));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn trash(&self, path: &Path) -> io::Result<DeleteOutcome> {
        if let Err(e) = fs::symlink_metadata(path) {
            if e.kind() == io::ErrorKind::NotFound {
                return Ok(DeleteOutcome::AlreadyGone);
            }
            return Err(e);
        }

        let (target, info_path) = self.reserve(path)?;
        match fs::rename(path, &target) {
            Ok(()) => Ok(DeleteOutcome::Trashed),
            Err(e) => {
                let _ = fs::remove_file(&info_path);
                if e.raw_os_error() == Some(libc::EXDEV) {
                    warn!(
                        "{} is on another filesystem than the trash, deleting permanently",
                        path.display()
                    );
                    remove_path(path)
                } else if e.kind() == io::ErrorKind::NotFound {
                    Ok(DeleteOutcome::AlreadyGone)
                } else {
                    Err(e)
                }
            }
        }
    }
}

impl DeletionHandler for TrashDeleter {
    fn delete(&self, path: &Path, kind: EntryKind) -> Result<DeleteOutcome, DeleteError> {
        debug!("Trashing {:?} {}", kind, path.display());
        self.trash(path).map_err(|source| DeleteError {
            path: path.to_path_buf(),
            source,
        })
    }

    fn is_reversible(&self) -> bool {
        true
    }
}

fn encode_path(path: &Path) -> String {
    path.to_string_lossy()
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Pick the deletion capability for a run. Entries are only moved into a
/// trash on the same filesystem as `destination`: the configured (or home)
/// trash when it shares the device, the volume's own `.Trash-<uid>`
/// otherwise. The returned notice is set when a reversible handler was
/// wanted but could not be prepared.
pub fn select_handler(
    mode: DeletionMode,
    trash_dir: Option<&Path>,
    destination: &Path,
) -> (Arc<dyn DeletionHandler>, Option<String>) {
    if mode == DeletionMode::Permanent {
        return (Arc::new(PermanentDeleter), None);
    }

    let preferred = trash_dir
        .map(Path::to_path_buf)
        .or_else(TrashDeleter::home_trash);
    let dest_device = device_of(destination);

    let attempt = match preferred {
        Some(root) if dest_device.is_some() && device_of(&root) == dest_device => {
            TrashDeleter::new(&root).map_err(|e| (root, e))
        }
        other => {
            if let Some(root) = other {
                debug!(
                    "Trash {} is not on the filesystem of {}",
                    root.display(),
                    destination.display()
                );
            }
            TrashDeleter::for_volume(destination).map_err(|e| (destination.join(".Trash-*"), e))
        }
    };

    let notice = match attempt {
        Ok(trash) => {
            info!("Deleted entries go to trash at {}", trash.files_dir().display());
            return (Arc::new(trash), None);
        }
        Err((root, e)) => format!(
            "Trash at {} is unavailable ({}); deletions are permanent for this run",
            root.display(),
            e
        ),
    };

    warn!("{}", notice);
    (Arc::new(PermanentDeleter), Some(notice))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_permanent_removes_files_and_trees() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("old.txt");
        let dir = tmp.path().join("old");
        fs::write(&file, b"x").unwrap();
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested/f"), b"y").unwrap();

        let deleter = PermanentDeleter;
        assert_eq!(deleter.delete(&file, EntryKind::File).unwrap(), DeleteOutcome::Removed);
        assert_eq!(deleter.delete(&dir, EntryKind::Directory).unwrap(), DeleteOutcome::Removed);
        assert!(!file.exists());
        assert!(!dir.exists());
        assert_eq!(deleter.delete(&file, EntryKind::File).unwrap(), DeleteOutcome::AlreadyGone);
    }

    #[test]
    fn test_permanent_removes_symlink_not_target() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("target");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep"), b"k").unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        PermanentDeleter.delete(&link, EntryKind::Symlink).unwrap();
        assert!(fs::symlink_metadata(&link).is_err());
        assert!(target.join("keep").exists());
    }

    #[test]
    fn test_trash_moves_entry_and_writes_info() {
        let tmp = TempDir::new().unwrap();
        let trash = TrashDeleter::new(tmp.path().join("Trash")).unwrap();
        let victim = tmp.path().join("my file.txt");
        fs::write(&victim, b"data").unwrap();

        let outcome = trash.delete(&victim, EntryKind::File).unwrap();
        assert_eq!(outcome, DeleteOutcome::Trashed);
        assert!(!victim.exists());
        assert_eq!(fs::read(trash.files_dir().join("my file.txt")).unwrap(), b"data");

        let info = fs::read_to_string(tmp.path().join("Trash/info/my file.txt.trashinfo")).unwrap();
        assert!(info.starts_with("[Trash Info]\n"));
        assert!(info.contains("my%20file.txt"));
        assert!(info.contains("DeletionDate="));
    }

    #[test]
    fn test_trash_name_clash_gets_suffix() {
        let tmp = TempDir::new().unwrap();
        let trash = TrashDeleter::new(tmp.path().join("Trash")).unwrap();
        for content in [b"one", b"two"] {
            let victim = tmp.path().join("dup.txt");
            fs::write(&victim, content).unwrap();
            trash.delete(&victim, EntryKind::File).unwrap();
        }
        assert_eq!(fs::read(trash.files_dir().join("dup.txt")).unwrap(), b"one");
        assert_eq!(fs::read(trash.files_dir().join("dup.txt.2")).unwrap(), b"two");
    }

    #[test]
    fn test_trash_missing_entry_is_already_gone() {
        let tmp = TempDir::new().unwrap();
        let trash = TrashDeleter::new(tmp.path().join("Trash")).unwrap();
        let outcome = trash.delete(&tmp.path().join("nope"), EntryKind::File).unwrap();
        assert_eq!(outcome, DeleteOutcome::AlreadyGone);
    }

    #[test]
    fn test_select_handler_modes() {
        let tmp = TempDir::new().unwrap();
        let (handler, notice) =
            select_handler(DeletionMode::Permanent, Some(tmp.path()), tmp.path());
        assert!(!handler.is_reversible());
        assert!(notice.is_none());

        let trash_root = tmp.path().join("Trash");
        let (handler, notice) =
            select_handler(DeletionMode::Auto, Some(trash_root.as_path()), tmp.path());
        assert!(handler.is_reversible());
        assert!(notice.is_none());

        // A regular file where the trash should be cannot hold files/ and info/
        let blocked = tmp.path().join("blocked");
        fs::write(&blocked, b"").unwrap();
        let (handler, notice) =
            select_handler(DeletionMode::Trash, Some(blocked.as_path()), tmp.path());
        assert!(!handler.is_reversible());
        assert!(notice.is_some());
    }

    #[test]
    fn test_trash_on_other_filesystem_uses_volume_trash() {
        let shm = Path::new("/dev/shm");
        let home = TempDir::new().unwrap();
        if !shm.is_dir() || device_of(shm) == device_of(home.path()) {
            eprintln!("skipping: /dev/shm is not a separate filesystem on this host");
            return;
        }
        let dest = match TempDir::new_in(shm) {
            Ok(dest) => dest,
            Err(e) => {
                eprintln!("skipping: cannot write to /dev/shm: {}", e);
                return;
            }
        };

        let home_trash = home.path().join("Trash");
        let (handler, notice) =
            select_handler(DeletionMode::Auto, Some(home_trash.as_path()), dest.path());
        assert!(notice.is_none());
        assert!(handler.is_reversible());

        let name = format!("old-{}.txt", uuid::Uuid::new_v4().simple());
        let victim = dest.path().join(&name);
        fs::write(&victim, b"data").unwrap();
        assert_eq!(handler.delete(&victim, EntryKind::File).unwrap(), DeleteOutcome::Trashed);
        assert!(!home_trash.exists());

        let volume_trash = volume_root(dest.path())
            .unwrap()
            .join(format!(".Trash-{}", rustix::process::geteuid().as_raw()));
        let trashed = volume_trash.join("files").join(&name);
        assert_eq!(fs::read(&trashed).unwrap(), b"data");
        fs::remove_file(trashed).unwrap();
        fs::remove_file(volume_trash.join("info").join(format!("{}.trashinfo", name))).unwrap();
    }
}
