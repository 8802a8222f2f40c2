//! Configuration Vault – reads/writes `~/.mnemos/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use mnemos_memory::{IndexParams, StorageLocation};
use mnemos_types::{
    DEFAULT_DIMENSION, DEFAULT_DOCUMENT_MAX_RESULTS, DEFAULT_DOCUMENT_THRESHOLD,
    DEFAULT_MEMORY_MAX_RESULTS, DEFAULT_MEMORY_THRESHOLD, DocumentQuery, MemoryQuery,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// `[index]` table: tuning of every collection's similarity index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Live vectors needed before the coarse quantiser is trained.
    #[serde(default = "default_min_train_size")]
    pub min_train_size: usize,

    /// Inverted lists probed per query; `sqrt(lists)` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<usize>,

    #[serde(default = "default_kmeans_iterations")]
    pub kmeans_iterations: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// A `[documents]` or `[agents]` table: retrieval defaults applied when the
/// caller does not pass explicit parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub similarity_threshold: f32,
    pub max_results: usize,
}

/// Persisted configuration stored in `~/.mnemos/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Embedding width every collection is provisioned with.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// SQLite database file. In-memory storage when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default = "default_documents")]
    pub documents: RetrievalConfig,

    #[serde(default = "default_agents")]
    pub agents: RetrievalConfig,
}

fn default_dimension() -> usize {
    DEFAULT_DIMENSION
}
fn default_min_train_size() -> usize {
    IndexParams::default().min_train_size
}
fn default_kmeans_iterations() -> usize {
    IndexParams::default().kmeans_iterations
}
fn default_seed() -> u64 {
    IndexParams::default().seed
}
fn default_documents() -> RetrievalConfig {
    RetrievalConfig {
        similarity_threshold: DEFAULT_DOCUMENT_THRESHOLD,
        max_results: DEFAULT_DOCUMENT_MAX_RESULTS,
    }
}
fn default_agents() -> RetrievalConfig {
    RetrievalConfig {
        similarity_threshold: DEFAULT_MEMORY_THRESHOLD,
        max_results: DEFAULT_MEMORY_MAX_RESULTS,
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            min_train_size: default_min_train_size(),
            probes: None,
            kmeans_iterations: default_kmeans_iterations(),
            seed: default_seed(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            storage_path: None,
            index: IndexConfig::default(),
            documents: default_documents(),
            agents: default_agents(),
        }
    }
}

impl Config {
    /// Reject values no collection can be opened or queried with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dimension == 0 {
            return Err(ConfigError::Invalid("dimension must be positive".to_string()));
        }
        if self.index.probes == Some(0) {
            return Err(ConfigError::Invalid("index.probes must be positive".to_string()));
        }
        for (table, retrieval) in [("documents", &self.documents), ("agents", &self.agents)] {
            if !(0.0..=1.0).contains(&retrieval.similarity_threshold) {
                return Err(ConfigError::Invalid(format!(
                    "{table}.similarity_threshold {} is outside [0, 1]",
                    retrieval.similarity_threshold
                )));
            }
            if retrieval.max_results == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{table}.max_results must be positive"
                )));
            }
        }
        Ok(())
    }

    pub fn storage_location(&self) -> StorageLocation {
        match &self.storage_path {
            Some(path) => StorageLocation::File(path.clone()),
            None => StorageLocation::InMemory,
        }
    }

    pub fn index_params(&self) -> IndexParams {
        IndexParams {
            min_train_size: self.index.min_train_size,
            probes: self.index.probes,
            kmeans_iterations: self.index.kmeans_iterations,
            seed: self.index.seed,
        }
    }

    /// Document search parameters with the configured defaults.
    pub fn document_query(&self, category: Option<&str>) -> DocumentQuery {
        DocumentQuery {
            category: category.map(str::to_string),
            similarity_threshold: self.documents.similarity_threshold,
            max_results: self.documents.max_results,
        }
    }

    /// Agent memory retrieval parameters with the configured defaults.
    pub fn memory_query(&self, memory_type: Option<&str>) -> MemoryQuery {
        MemoryQuery {
            memory_type: memory_type.map(str::to_string),
            similarity_threshold: self.agents.similarity_threshold,
            max_results: self.agents.max_results,
        }
    }
}

/// Return the path to `~/.mnemos/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".mnemos").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    load_from(&config_path())
}

/// Load the config from disk, falling back to the defaults (plus environment
/// overrides) when no file exists.
pub fn load_or_default() -> Result<Config, ConfigError> {
    match load()? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

/// Load the config from a specific path.
pub fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
    let mut cfg: Config = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `MNEMOS_*` environment variable overrides to `cfg`. Values that do
/// not parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `MNEMOS_DIMENSION` | `dimension` |
/// | `MNEMOS_STORAGE_PATH` | `storage_path` |
/// | `MNEMOS_DOCUMENT_THRESHOLD` | `documents.similarity_threshold` |
/// | `MNEMOS_AGENT_THRESHOLD` | `agents.similarity_threshold` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("MNEMOS_DIMENSION")
        && let Ok(dimension) = v.parse::<usize>() {
            cfg.dimension = dimension;
        }
    if let Ok(v) = std::env::var("MNEMOS_STORAGE_PATH")
        && !v.trim().is_empty() {
            cfg.storage_path = Some(PathBuf::from(v));
        }
    if let Ok(v) = std::env::var("MNEMOS_DOCUMENT_THRESHOLD")
        && let Ok(threshold) = v.parse::<f32>() {
            cfg.documents.similarity_threshold = threshold;
        }
    if let Ok(v) = std::env::var("MNEMOS_AGENT_THRESHOLD")
        && let Ok(threshold) = v.parse::<f32>() {
            cfg.agents.similarity_threshold = threshold;
        }
}

/// Save the config to disk, creating `~/.mnemos/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
        // Restrict the config directory to the owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| ConfigError::io(parent, e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    // Write the file with owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| ConfigError::io(path, e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| ConfigError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700, "config directory must have 0o700 permissions");
    }

    #[test]
    fn roundtrip_custom_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.index.min_train_size = 64;
        cfg.index.probes = Some(3);
        cfg.documents.max_results = 20;
        cfg.agents.max_results = 7;
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.index.min_train_size, 64);
        assert_eq!(loaded.index.probes, Some(3));
        assert_eq!(loaded.documents.max_results, 20);
        assert_eq!(loaded.agents.max_results, 7);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[index]\nseed = 7\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.index.seed, 7);
        assert_eq!(loaded.index.min_train_size, 256);
        assert_eq!(loaded.index.kmeans_iterations, 10);
        assert_eq!(loaded.documents.max_results, 10);
        assert_eq!(loaded.agents.max_results, 5);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "dimension = \"wide\"").unwrap();
        assert!(matches!(load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn config_path_points_to_mnemos_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".mnemos"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        cfg.validate().expect("valid");
        assert_eq!(cfg.dimension, 1536);
        assert!(matches!(cfg.storage_location(), StorageLocation::InMemory));
        assert_eq!(cfg.document_query(Some("task")).category.as_deref(), Some("task"));
        assert_eq!(cfg.memory_query(None).max_results, 5);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.dimension = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.documents.similarity_threshold = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.agents.max_results = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.index.probes = Some(0);
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn apply_env_overrides_changes_dimension() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("MNEMOS_DIMENSION", "384") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.dimension, 384);
        unsafe { std::env::remove_var("MNEMOS_DIMENSION") };
    }

    #[test]
    fn apply_env_overrides_changes_storage_path() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("MNEMOS_STORAGE_PATH", "/var/lib/mnemos/memory.db") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.storage_path, Some(PathBuf::from("/var/lib/mnemos/memory.db")));
        unsafe { std::env::remove_var("MNEMOS_STORAGE_PATH") };
    }

    #[test]
    fn apply_env_overrides_changes_document_threshold() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("MNEMOS_DOCUMENT_THRESHOLD", "0.85") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!((cfg.documents.similarity_threshold - 0.85).abs() < f32::EPSILON);
        unsafe { std::env::remove_var("MNEMOS_DOCUMENT_THRESHOLD") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_threshold() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("MNEMOS_AGENT_THRESHOLD", "not-a-number") };
        let mut cfg = Config::default();
        let original = cfg.agents.similarity_threshold;
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.agents.similarity_threshold, original);
        unsafe { std::env::remove_var("MNEMOS_AGENT_THRESHOLD") };
    }
}
