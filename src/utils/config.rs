use crate::backup::DeletionMode;
use crate::error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A named backup job as stored in the configuration directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupConfig {
    #[serde(default)]
    pub name: String,

    /// Source roots, mirrored in this order
    #[serde(default)]
    pub sources: Vec<PathBuf>,

    /// Glob patterns
    #[serde(default)]
    pub excludes: Vec<String>,

    /// Stored as an empty string when unset
    #[serde(
        default,
        serialize_with = "serialize_destination",
        deserialize_with = "deserialize_destination"
    )]
    pub destination: Option<PathBuf>,
}

fn serialize_destination<S: Serializer>(value: &Option<PathBuf>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(path) => path.serialize(s),
        None => s.serialize_str(""),
    }
}

fn deserialize_destination<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PathBuf>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from))
}

impl BackupConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Name with spaces replaced, plus `.json`.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.name.replace(' ', "_"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: BackupConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if config.name.is_empty() {
            config.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        debug!("Loaded configuration '{}' from {}", config.name, path.display());
        Ok(config)
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf, ConfigError> {
        let path = dir.join(self.file_name());
        let write_err = |source| ConfigError::Write {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(dir).map_err(write_err)?;
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Serialize {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(write_err)?;

        info!("Saved config {}", path.display());
        Ok(path)
    }

    /// Every `*.json` configuration in `dir`, sorted by name. Files that fail
    /// to parse are skipped with a warning; a missing directory is empty.
    pub fn discover(dir: &Path) -> Result<Vec<Self>, ConfigError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        let mut configs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::load(&path) {
                Ok(config) => configs.push(config),
                Err(e) => warn!("Skipping {}", e),
            }
        }
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    /// Resolve a CLI argument: an existing file path, or a configuration
    /// name looked up in `dir`.
    pub fn find(dir: &Path, name_or_path: &str) -> Result<Self, ConfigError> {
        let candidate = Path::new(name_or_path);
        if candidate.is_file() {
            return Self::load(candidate);
        }

        let by_file = dir.join(Self::new(name_or_path).file_name());
        if by_file.is_file() {
            return Self::load(&by_file);
        }

        Self::discover(dir)?
            .into_iter()
            .find(|c| c.name == name_or_path)
            .ok_or_else(|| ConfigError::Read {
                path: by_file,
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no configuration named '{}'", name_or_path),
                ),
            })
    }
}

/// Engine settings: defaults, then an optional settings file, then
/// `BACKUP_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Execution workers (0 = one per CPU)
    pub max_workers: usize,

    /// Capacity of a run's event channel
    pub event_capacity: usize,

    pub deletion: DeletionMode,

    /// Holding area for reversible deletion; `$XDG_DATA_HOME/Trash` when unset
    #[serde(default)]
    pub trash_dir: Option<PathBuf>,

    pub config_dir: PathBuf,

    pub log_filter: String,

    pub log_json: bool,

    /// Flush copied data to disk before it is renamed into place
    pub fsync: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_workers: 0,
            event_capacity: 1024,
            deletion: DeletionMode::Auto,
            trash_dir: None,
            config_dir: default_config_dir(),
            log_filter: "info".to_string(),
            log_json: false,
            fsync: false,
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("backup-mirror"))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Settings {
    /// Load settings from the environment (after reading any `.env` file)
    /// and the optional settings file.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::build(file, true)
    }

    fn build(file: Option<&Path>, with_env: bool) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let mut builder = config::Config::builder()
            .set_default("max_workers", defaults.max_workers as i64)?
            .set_default("event_capacity", defaults.event_capacity as i64)?
            .set_default("deletion", "auto")?
            .set_default("config_dir", defaults.config_dir.to_string_lossy().into_owned())?
            .set_default("log_filter", defaults.log_filter)?
            .set_default("log_json", defaults.log_json)?
            .set_default("fsync", defaults.fsync)?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        if with_env {
            builder = builder.add_source(config::Environment::with_prefix("BACKUP").try_parsing(true));
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings.normalized())
    }

    fn normalized(mut self) -> Self {
        if self.event_capacity == 0 {
            self.event_capacity = 1;
        }
        self
    }

    pub fn effective_workers(&self) -> usize {
        if self.max_workers == 0 {
            num_cpus::get()
        } else {
            self.max_workers
        }
    }
}
