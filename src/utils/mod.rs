pub mod config;
pub mod disk;
pub mod log_buffer;
pub mod logging;

pub use config::{BackupConfig, Settings};
pub use log_buffer::LogBuffer;
