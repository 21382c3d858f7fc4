//! Mirrors one or more source trees into a destination directory.
//!
//! [`BackupOrchestrator`] is the entry point: it validates a
//! [`BackupConfig`], then scans, plans and executes the run on a worker pool
//! while reporting every step as a [`RunEvent`].

pub mod backup;
pub mod error;
pub mod utils;

pub use backup::{BackupOrchestrator, BackupState, RunEvent, RunHandle, RunOptions, RunOutcome};
pub use error::{ConfigError, RunError};
pub use utils::config::{BackupConfig, Settings};
