//! Configuration management.
//!
//! [`KgConfig`] is passed explicitly to constructors; nothing reads it from a
//! global. Values come from, in increasing priority: built-in defaults, a TOML
//! file and `VKG_*` environment variables.
//!
//! ```toml
//! data_dir = "/var/lib/vkg"
//!
//! [storage]
//! path = "/var/lib/vkg/graph.db"
//!
//! [timeouts]
//! busy_timeout_ms = 2000
//!
//! [ingest]
//! ignored_actions = [72, 74]
//! redis_url = "redis://127.0.0.1:6379"
//!
//! [logging]
//! format = "json"
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the data directory.
pub const ENV_DATA_DIR: &str = "VKG_DATA_DIR";
/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "VKG_LOG_LEVEL";
/// Environment variable overriding the Redis URL.
pub const ENV_REDIS_URL: &str = "VKG_REDIS_URL";

/// Semantic actions skipped by default: deleted (72) and moved in space (74).
pub const DEFAULT_IGNORED_ACTIONS: [i64; 2] = [72, 74];

/// Record kinds skipped by default.
pub const DEFAULT_IGNORED_KINDS: [&str; 3] = [
    "ZetUniverse.Kinds.Topic",
    "ZetUniverse.Kinds.UserIdentificator",
    "ZetUniverse.Kinds.Views.GraphView",
];

/// Record keys stored as immutable entity properties by default.
pub const DEFAULT_IMMUTABLE_KEYS: [&str; 2] = ["AppId", "Id"];

/// Main configuration for versioned-kg.
///
/// A `None` path selects the in-memory variant of that component.
#[derive(Debug, Clone, PartialEq)]
pub struct KgConfig {
    /// Directory that default paths are resolved against.
    pub data_dir: PathBuf,
    /// Graph store.
    pub storage: StorageConfig,
    /// Ontology documents.
    pub ontology: OntologyConfig,
    /// Id reservation log.
    pub id_index: IdIndexConfig,
    /// Full-text entity index.
    pub index: IndexConfig,
    /// Backing-store timeouts.
    pub timeouts: TimeoutConfig,
    /// Ingestion connector.
    pub ingest: IngestConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Graph store configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfig {
    /// `SQLite` database file.
    pub path: Option<PathBuf>,
}

/// Ontology configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OntologyConfig {
    /// Directory holding `kinds.json` and `relationship_model.json`.
    pub dir: Option<PathBuf>,
}

/// Id index configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdIndexConfig {
    /// Append-only id log.
    pub path: Option<PathBuf>,
}

/// Entity index configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexConfig {
    /// FTS5 database file.
    pub path: Option<PathBuf>,
}

/// Timeout configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// How long a call waits on a locked database.
    pub busy_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            busy_timeout: crate::storage::sqlite::DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// Ingestion connector configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    /// Semantic action codes whose records are dropped.
    pub ignored_actions: Vec<i64>,
    /// Record kinds that are dropped.
    pub ignored_kinds: Vec<String>,
    /// Record keys stored as immutable entity properties.
    pub immutable_keys: Vec<String>,
    /// Delay between Redis polls.
    pub poll_interval: Duration,
    /// Number of Redis polls before the loop stops; `None` polls forever.
    pub max_polls: Option<u64>,
    /// Redis connection URL.
    pub redis_url: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            ignored_actions: DEFAULT_IGNORED_ACTIONS.to_vec(),
            ignored_kinds: DEFAULT_IGNORED_KINDS.iter().map(ToString::to_string).collect(),
            immutable_keys: DEFAULT_IMMUTABLE_KEYS.iter().map(ToString::to_string).collect(),
            poll_interval: Duration::from_secs(5),
            max_polls: None,
            redis_url: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Human-readable multi-line output.
    Pretty,
}

impl LogFormat {
    /// Parses a format name, falling back to JSON.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Self::Pretty,
            _ => Self::Json,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Default filter directive, such as `info` or `versioned_kg=debug`.
    pub level: String,
    /// Optional file receiving log output instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Data directory.
    pub data_dir: Option<String>,
    /// Storage section.
    pub storage: Option<ConfigFilePath>,
    /// Ontology section.
    pub ontology: Option<ConfigFileOntology>,
    /// Id index section.
    pub id_index: Option<ConfigFilePath>,
    /// Entity index section.
    pub index: Option<ConfigFilePath>,
    /// Timeouts section.
    pub timeouts: Option<ConfigFileTimeouts>,
    /// Ingest section.
    pub ingest: Option<ConfigFileIngest>,
    /// Logging section.
    pub logging: Option<ConfigFileLogging>,
}

/// A section holding one path.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFilePath {
    /// File path.
    pub path: Option<String>,
    /// Keep the component in memory.
    pub in_memory: Option<bool>,
}

/// Ontology section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileOntology {
    /// Directory of the ontology documents.
    pub dir: Option<String>,
    /// Keep the ontology in memory.
    pub in_memory: Option<bool>,
}

/// Timeouts section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileTimeouts {
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: Option<u64>,
}

/// Ingest section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileIngest {
    /// Ignored semantic actions.
    pub ignored_actions: Option<Vec<i64>>,
    /// Ignored kinds.
    pub ignored_kinds: Option<Vec<String>>,
    /// Immutable keys.
    pub immutable_keys: Option<Vec<String>>,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Maximum number of polls.
    pub max_polls: Option<u64>,
    /// Redis URL.
    pub redis_url: Option<String>,
}

/// Logging section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileLogging {
    /// `json` or `pretty`.
    pub format: Option<String>,
    /// Filter directive.
    pub level: Option<String>,
    /// Log file.
    pub file: Option<String>,
}

impl Default for KgConfig {
    fn default() -> Self {
        let data_dir =
            crate::storage::get_user_data_dir().unwrap_or_else(|_| PathBuf::from(".versioned-kg"));
        Self::with_data_dir(data_dir)
    }
}

impl KgConfig {
    /// Creates a configuration whose files all live under `data_dir`.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            storage: StorageConfig {
                path: Some(data_dir.join("graph.db")),
            },
            ontology: OntologyConfig {
                dir: Some(data_dir.join("ontology")),
            },
            id_index: IdIndexConfig {
                path: Some(data_dir.join("db_ids.txt")),
            },
            index: IndexConfig {
                path: Some(data_dir.join("index.db")),
            },
            timeouts: TimeoutConfig::default(),
            ingest: IngestConfig::default(),
            logging: LoggingConfig::default(),
            data_dir,
        }
    }

    /// Creates a configuration that keeps every component in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            storage: StorageConfig::default(),
            ontology: OntologyConfig::default(),
            id_index: IdIndexConfig::default(),
            index: IndexConfig::default(),
            timeouts: TimeoutConfig::default(),
            ingest: IngestConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Loads configuration from a file path, then applies `VKG_*` overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> crate::Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| crate::Error::OperationFailed {
                operation: "read_config_file".to_string(),
                cause: e.to_string(),
            })?;

        let file: ConfigFile =
            toml::from_str(&contents).map_err(|e| crate::Error::OperationFailed {
                operation: "parse_config_file".to_string(),
                cause: e.to_string(),
            })?;

        Ok(Self::from_config_file(file, |key| std::env::var(key).ok()))
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the platform config dir, then `~/.config/versioned-kg/`.
    /// Returns defaults (with `VKG_*` overrides) if no file is found.
    #[must_use]
    pub fn load_default() -> Self {
        let env = |key: &str| std::env::var(key).ok();
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::from_config_file(ConfigFile::default(), env);
        };

        let candidates = [
            base_dirs.config_dir().join("versioned-kg").join("config.toml"),
            base_dirs
                .home_dir()
                .join(".config")
                .join("versioned-kg")
                .join("config.toml"),
        ];
        for candidate in candidates.iter().filter(|p| p.exists()) {
            match Self::load_from_file(candidate) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %candidate.display(), error = %e, "Ignoring unreadable config file");
                },
            }
        }

        Self::from_config_file(ConfigFile::default(), env)
    }

    /// Converts a `ConfigFile` to `KgConfig`, consulting `env` for overrides.
    pub fn from_config_file(file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env(ENV_DATA_DIR)
            .or(file.data_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default().data_dir);
        let mut config = Self::with_data_dir(data_dir);

        if let Some(storage) = file.storage {
            config.storage.path = resolve_path(storage.path, storage.in_memory, config.storage.path);
        }
        if let Some(ontology) = file.ontology {
            config.ontology.dir = resolve_path(ontology.dir, ontology.in_memory, config.ontology.dir);
        }
        if let Some(id_index) = file.id_index {
            config.id_index.path =
                resolve_path(id_index.path, id_index.in_memory, config.id_index.path);
        }
        if let Some(index) = file.index {
            config.index.path = resolve_path(index.path, index.in_memory, config.index.path);
        }
        if let Some(ms) = file.timeouts.and_then(|t| t.busy_timeout_ms) {
            config.timeouts.busy_timeout = Duration::from_millis(ms);
        }
        if let Some(ingest) = file.ingest {
            if let Some(v) = ingest.ignored_actions {
                config.ingest.ignored_actions = v;
            }
            if let Some(v) = ingest.ignored_kinds {
                config.ingest.ignored_kinds = v;
            }
            if let Some(v) = ingest.immutable_keys {
                config.ingest.immutable_keys = v;
            }
            if let Some(ms) = ingest.poll_interval_ms {
                config.ingest.poll_interval = Duration::from_millis(ms);
            }
            config.ingest.max_polls = ingest.max_polls;
            config.ingest.redis_url = ingest.redis_url;
        }
        if let Some(logging) = file.logging {
            if let Some(format) = logging.format {
                config.logging.format = LogFormat::parse(&format);
            }
            if let Some(level) = logging.level {
                config.logging.level = level;
            }
            config.logging.file = logging.file.map(PathBuf::from);
        }

        if let Some(level) = env(ENV_LOG_LEVEL) {
            config.logging.level = level;
        }
        if let Some(url) = env(ENV_REDIS_URL) {
            config.ingest.redis_url = Some(url);
        }

        config
    }
}

fn resolve_path(
    path: Option<String>,
    in_memory: Option<bool>,
    default: Option<PathBuf>,
) -> Option<PathBuf> {
    if in_memory == Some(true) {
        return None;
    }
    path.map(PathBuf::from).or(default)
}
