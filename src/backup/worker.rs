use super::{Entry, PARTIAL_PREFIX};
use crate::error::CopyError;
use filetime::FileTime;
use std::fs::{self, File, Permissions};
use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Raw filesystem operations for one destination entry. Sources are only
/// ever opened for reading.
#[derive(Debug, Clone, Default)]
pub struct BackupWorker {
    fsync: bool,
    root: Option<PathBuf>,
}

impl BackupWorker {
    pub fn new(fsync: bool) -> Self {
        Self { fsync, root: None }
    }

    /// Refuse to write beneath a symlinked directory inside `root`, which
    /// could lead outside the mirror.
    pub fn confined_to(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    fn check_parents(&self, dest: &Path) -> io::Result<()> {
        let root = match &self.root {
            Some(root) => root,
            None => return Ok(()),
        };
        let mut dir = dest.parent();
        while let Some(current) = dir {
            if current == root.as_path() || !current.starts_with(root) {
                break;
            }
            if fs::symlink_metadata(current)?.file_type().is_symlink() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is a symbolic link", current.display()),
                ));
            }
            dir = current.parent();
        }
        Ok(())
    }

    /// Give the owner write access to an existing directory so entries can
    /// be added or removed. Returns the previous mode when it was changed.
    pub fn unlock_directory(&self, dir: &Path) -> Result<Option<u32>, CopyError> {
        let fail = |error| CopyError::Directory {
            dest: dir.to_path_buf(),
            error,
        };
        let metadata = match fs::symlink_metadata(dir) {
            Ok(m) if m.is_dir() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(fail(e)),
        };

        let mode = metadata.permissions().mode() & 0o7777;
        if mode & 0o300 == 0o300 {
            return Ok(None);
        }
        fs::set_permissions(dir, Permissions::from_mode(mode | 0o700)).map_err(fail)?;
        debug!("Opened {} for writing (was {:o})", dir.display(), mode);
        Ok(Some(mode))
    }

    /// Undo [`unlock_directory`](Self::unlock_directory). Paths that are no
    /// longer directories are left alone.
    pub fn restore_directory(&self, dir: &Path, mode: u32) -> Result<(), CopyError> {
        let restore = || -> io::Result<()> {
            match fs::symlink_metadata(dir) {
                Ok(m) if m.is_dir() => fs::set_permissions(dir, Permissions::from_mode(mode)),
                Ok(_) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        };
        restore().map_err(|error| CopyError::Directory {
            dest: dir.to_path_buf(),
            error,
        })
    }

    /// Create one directory. Its parent must already exist; permissions and
    /// mtime are applied later by [`finalize_directory`](Self::finalize_directory)
    /// so a read-only source directory can still receive children.
    pub fn create_directory(&self, dest: &Path) -> Result<(), CopyError> {
        if let Err(error) = self.check_parents(dest) {
            return Err(CopyError::Directory {
                dest: dest.to_path_buf(),
                error,
            });
        }
        match fs::create_dir(dest) {
            Ok(()) => {
                info!("Created directory {}", dest.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && is_real_dir(dest) => Ok(()),
            Err(error) => Err(CopyError::Directory {
                dest: dest.to_path_buf(),
                error,
            }),
        }
    }

    pub fn finalize_directory(&self, source: &Entry, dest: &Path) -> Result<(), CopyError> {
        let apply = || -> io::Result<()> {
            fs::set_permissions(dest, Permissions::from_mode(source.mode))?;
            filetime::set_file_mtime(dest, source.modified)
        };
        apply().map_err(|error| CopyError::Directory {
            dest: dest.to_path_buf(),
            error,
        })
    }

    /// Stream `source` into a staging file next to `dest`, apply mode and
    /// mtime, then rename over `dest`. Returns the number of bytes written.
    /// On failure the staging file is removed and `dest` is untouched.
    pub fn copy_file(&self, source: &Entry, dest: &Path) -> Result<u64, CopyError> {
        self.stage_and_rename(&source.path, dest)
            .map_err(|error| CopyError::File {
                source_path: source.path.clone(),
                dest: dest.to_path_buf(),
                error,
            })
    }

    fn stage_and_rename(&self, source: &Path, dest: &Path) -> io::Result<u64> {
        let parent = parent_of(dest)?;
        self.check_parents(dest)?;
        let mut reader = File::open(source)?;
        // Metadata of the opened handle, so mode and mtime match the bytes read
        let metadata = reader.metadata()?;

        let mut staged = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(parent)?;
        debug!("Staging {} as {}", dest.display(), staged.path().display());

        let bytes = io::copy(&mut reader, staged.as_file_mut())?;
        if self.fsync {
            staged.as_file().sync_all()?;
        }

        let mode = metadata.permissions().mode() & 0o7777;
        staged.as_file().set_permissions(Permissions::from_mode(mode))?;
        filetime::set_file_handle_times(
            staged.as_file(),
            Some(FileTime::from_last_access_time(&metadata)),
            Some(FileTime::from_last_modification_time(&metadata)),
        )?;

        staged.persist(dest).map_err(|e| e.error)?;
        info!("Copied {} ({} bytes)", dest.display(), bytes);
        Ok(bytes)
    }

    /// Replace whatever is at `dest` with a symlink carrying the recorded
    /// target. The link is created under a staging name and renamed into
    /// place.
    pub fn recreate_symlink(&self, source: &Entry, dest: &Path) -> Result<PathBuf, CopyError> {
        let fail = |error: io::Error| CopyError::Symlink {
            dest: dest.to_path_buf(),
            error,
        };

        let target = source.target.clone().ok_or_else(|| {
            fail(io::Error::new(
                io::ErrorKind::InvalidData,
                "symlink entry has no recorded target",
            ))
        })?;
        let parent = parent_of(dest).map_err(fail)?;
        self.check_parents(dest).map_err(fail)?;

        if is_real_dir(dest) {
            fs::remove_dir_all(dest).map_err(fail)?;
        }

        let staged = parent.join(format!("{}{}", PARTIAL_PREFIX, uuid::Uuid::new_v4().simple()));
        symlink(&target, &staged).map_err(fail)?;
        if let Err(e) = fs::rename(&staged, dest) {
            let _ = fs::remove_file(&staged);
            return Err(fail(e));
        }

        info!("Linked {} -> {}", dest.display(), target.display());
        Ok(target)
    }
}

fn parent_of(dest: &Path) -> io::Result<&Path> {
    dest.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", dest.display()),
        )
    })
}

fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}
