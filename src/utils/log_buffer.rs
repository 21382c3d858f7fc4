use crate::backup::RunEvent;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: String,
    pub message: String,
    pub path: Option<String>,
}

/// Bounded in-memory history of run events. Oldest entries fall off first.
#[derive(Clone)]
pub struct LogBuffer {
    buffer: Arc<Mutex<VecDeque<LogEntry>>>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    pub fn add_log(&self, level: &str, message: String, path: Option<String>) {
        let entry = LogEntry {
            timestamp: Utc::now().timestamp(),
            level: level.to_string(),
            message,
            path,
        };

        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    /// Progress ticks are not kept.
    pub fn record(&self, event: &RunEvent) {
        let display = |p: &std::path::Path| Some(p.display().to_string());
        match event {
            RunEvent::Progress { .. } => {}
            RunEvent::StateChanged { state } => {
                self.add_log("debug", format!("State changed to {:?}", state), None)
            }
            RunEvent::Info { message } => self.add_log("info", message.clone(), None),
            RunEvent::Planned { summary } => self.add_log(
                "info",
                format!(
                    "Planned {} changes ({} copies, {} bytes, {} deletions), {} unchanged",
                    summary.changes(),
                    summary.copies,
                    summary.copy_bytes,
                    summary.deletes,
                    summary.skips
                ),
                None,
            ),
            RunEvent::DirectoryCreated { path } => {
                self.add_log("info", "Created directory".to_string(), display(path))
            }
            RunEvent::Copied { path, bytes } => {
                self.add_log("info", format!("Copied {} bytes", bytes), display(path))
            }
            RunEvent::SymlinkCreated { path, target } => self.add_log(
                "info",
                format!("Linked to {}", target.display()),
                display(path),
            ),
            RunEvent::Skipped { path, reason } => {
                self.add_log("debug", format!("Skipped ({})", reason), display(path))
            }
            RunEvent::Deleted { path, reversible } => self.add_log(
                "info",
                if *reversible {
                    "Moved to trash".to_string()
                } else {
                    "Deleted permanently".to_string()
                },
                display(path),
            ),
            RunEvent::Warning { path, message } => {
                self.add_log("warn", message.clone(), path.as_deref().and_then(display))
            }
            RunEvent::Finished { summary } => self.add_log(
                "info",
                format!(
                    "Finished: {} copied, {} deleted, {} warnings",
                    summary.files_copied, summary.deleted, summary.warnings
                ),
                None,
            ),
            RunEvent::Stopped { summary } => self.add_log(
                "warn",
                format!("Stopped after copying {} files", summary.files_copied),
                None,
            ),
            RunEvent::Failed { message } => self.add_log("error", message.clone(), None),
        }
    }

    /// Most recent `limit` entries at warn level or above.
    pub fn recent_problems(&self, limit: usize) -> Vec<LogEntry> {
        let buffer = self.buffer.lock();
        let mut problems: Vec<LogEntry> = buffer
            .iter()
            .rev()
            .filter(|e| e.level == "warn" || e.level == "error")
            .take(limit)
            .cloned()
            .collect();
        problems.reverse();
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_oldest_entries_dropped() {
        let log = LogBuffer::new(3);
        for i in 0..5 {
            log.add_log("warn", format!("entry {}", i), None);
        }
        let messages: Vec<_> = log
            .recent_problems(10)
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["entry 2", "entry 3", "entry 4"]);
        assert_eq!(log.recent_problems(1)[0].message, "entry 4");
    }

    #[test]
    fn test_records_events_and_filters_problems() {
        let log = LogBuffer::new(100);
        log.record(&RunEvent::Progress {
            completed: 1,
            total: 2,
        });
        log.record(&RunEvent::Copied {
            path: PathBuf::from("a/keep.txt"),
            bytes: 10,
        });
        log.record(&RunEvent::warning(
            Some(PathBuf::from("/dest/a/locked")),
            "permission denied",
        ));
        log.record(&RunEvent::Failed {
            message: "destination vanished".to_string(),
        });

        assert_eq!(log.buffer.lock().len(), 3);
        let problems = log.recent_problems(10);
        assert_eq!(problems.len(), 2);
        assert_eq!(problems[0].path.as_deref(), Some("/dest/a/locked"));
        assert_eq!(problems[1].level, "error");
    }
}
