use crate::error::ConfigError;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Create the destination if needed and prove it accepts new files.
/// Returns the canonical destination path.
pub fn verify_destination(path: &Path) -> Result<PathBuf, ConfigError> {
    let unwritable = |source| ConfigError::DestinationUnwritable {
        path: path.to_path_buf(),
        source,
    };

    if !path.exists() {
        info!("Creating destination {}", path.display());
    }
    fs::create_dir_all(path).map_err(unwritable)?;
    let canonical = path.canonicalize().map_err(unwritable)?;
    if !canonical.is_dir() {
        return Err(unwritable(io::Error::new(
            io::ErrorKind::InvalidInput,
            "destination is not a directory",
        )));
    }

    // Dropped immediately, which removes the test file
    tempfile::Builder::new()
        .prefix(crate::backup::PARTIAL_PREFIX)
        .tempfile_in(&canonical)
        .map_err(unwritable)?;

    debug!("Destination {} is writable", canonical.display());
    Ok(canonical)
}

/// Bytes available to an unprivileged user on the filesystem holding `path`.
pub fn free_space(path: &Path) -> io::Result<u64> {
    fs2::available_space(path)
}

/// Top directory of the filesystem holding `path`: the highest ancestor
/// still on the same device.
pub fn volume_root(path: &Path) -> io::Result<PathBuf> {
    let path = path.canonicalize()?;
    let device = fs::metadata(&path)?.dev();

    let mut top = path.as_path();
    while let Some(parent) = top.parent() {
        match fs::metadata(parent) {
            Ok(m) if m.dev() == device => top = parent,
            _ => break,
        }
    }
    Ok(top.to_path_buf())
}

/// Device of `path`, or of its closest existing ancestor.
pub fn device_of(path: &Path) -> Option<u64> {
    path.ancestors()
        .find_map(|p| fs::metadata(p).ok())
        .map(|m| m.dev())
}

/// Lexical containment check on normalized absolute paths.
pub fn is_within(path: &Path, ancestor: &Path) -> bool {
    normalize(path).starts_with(normalize(ancestor))
}

/// Canonical path when it exists, the lexical absolute form otherwise.
pub fn normalize(path: &Path) -> PathBuf {
    path.canonicalize()
        .unwrap_or_else(|_| lexical_absolute(path))
}

/// Absolute path with `.` and `..` resolved without touching the
/// filesystem, so a symlinked root keeps its own name.
pub fn lexical_absolute(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
