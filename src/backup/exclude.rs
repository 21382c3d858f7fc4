use crate::error::ConfigError;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::debug;

/// Shell-style exclude patterns compiled once into a single glob set.
///
/// `*` matches any run of characters including `/`, `?` matches one
/// character and `[...]` / `[!...]` are character classes. A candidate is
/// tested both relative to its source root and as an absolute path, so
/// `node_modules/*` and `/home/user/project/node_modules/*` both work.
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
    patterns: Vec<String>,
    set: GlobSet,
}

impl ExcludeMatcher {
    pub fn new<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(false)
                .backslash_escape(true)
                .build()
                .map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
            debug!("Exclude pattern {} compiled", pattern);
            builder.add(glob);
        }

        let set = builder.build().map_err(|source| ConfigError::InvalidPattern {
            pattern: patterns.join(", "),
            source,
        })?;

        Ok(Self { patterns, set })
    }

    /// A matcher that excludes nothing.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.is_empty() {
            return false;
        }
        self.set.is_match(path)
    }

    /// Directories are also tested with a trailing `/`, which lets
    /// `node_modules/*` prune the directory itself instead of only its
    /// children.
    pub fn is_entry_excluded(&self, relative: &Path, absolute: &Path, is_dir: bool) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.set.is_match(relative) || self.set.is_match(absolute) {
            return true;
        }
        if !is_dir {
            return false;
        }

        let relative = relative.to_string_lossy();
        (!relative.is_empty() && self.set.is_match(format!("{}/", relative)))
            || self.set.is_match(format!("{}/", absolute.to_string_lossy()))
    }
}
