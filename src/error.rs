use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Invalid or missing configuration. A run never starts when one of these is
/// returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("backup configuration '{0}' has no source roots")]
    NoSources(String),

    #[error("none of the configured source roots exist or are readable")]
    NoReadableSources,

    #[error("source root {0} has no final path component to mirror under")]
    UnnamedSource(PathBuf),

    #[error("source root {source_root} lies inside destination {destination}")]
    SourceInsideDestination {
        source_root: PathBuf,
        destination: PathBuf,
    },

    #[error("no destination configured")]
    MissingDestination,

    #[error("destination {path} is not writable: {source}")]
    DestinationUnwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid exclude pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize configuration {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write configuration {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid engine settings: {0}")]
    Settings(#[from] config::ConfigError),
}

/// A single entry could not be scanned. Recorded as a warning; the scan
/// continues without it.
#[derive(Debug, Error)]
#[error("cannot scan {path}: {source}")]
pub struct ScanError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl ScanError {
    pub fn unsupported(path: PathBuf) -> Self {
        Self {
            path,
            source: io::Error::new(io::ErrorKind::Unsupported, "unsupported file type"),
        }
    }

    /// Source entries carrying the staging prefix would be taken for stale
    /// partial files in the mirror.
    pub fn reserved(path: PathBuf) -> Self {
        Self {
            path,
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "name uses the reserved partial-file prefix",
            ),
        }
    }
}

/// Ambiguities found while merging source inventories.
#[derive(Debug, Clone, Error)]
pub enum PlanError {
    #[error("{path} is provided by both {kept} and {ignored}; keeping {kept}")]
    Collision {
        path: PathBuf,
        kept: PathBuf,
        ignored: PathBuf,
    },
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("failed to copy {source_path} to {dest}: {error}")]
    File {
        source_path: PathBuf,
        dest: PathBuf,
        #[source]
        error: io::Error,
    },

    #[error("failed to create symlink {dest}: {error}")]
    Symlink {
        dest: PathBuf,
        #[source]
        error: io::Error,
    },

    #[error("failed to create directory {dest}: {error}")]
    Directory {
        dest: PathBuf,
        #[source]
        error: io::Error,
    },
}

#[derive(Debug, Error)]
#[error("failed to delete {path}: {source}")]
pub struct DeleteError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Marker for an observed stop request. Not a failure: the orchestrator maps
/// it to the Stopped state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancellation requested")]
pub struct Cancelled;

/// Errors surfaced by the orchestrator itself.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("a backup run is already active")]
    AlreadyRunning,

    #[error("{0}")]
    Environment(String),
}

/// Failure of a single plan action. Reported as a warning, never fatal.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Copy(#[from] CopyError),

    #[error(transparent)]
    Delete(#[from] DeleteError),
}

impl ActionError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            ActionError::Copy(CopyError::File { dest, .. })
            | ActionError::Copy(CopyError::Symlink { dest, .. })
            | ActionError::Copy(CopyError::Directory { dest, .. }) => dest,
            ActionError::Delete(e) => &e.path,
        }
    }
}
