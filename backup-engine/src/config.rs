//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file, then applies an enumerated set of
//! environment overrides (after reading `.env`), then validates.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub destinations: DestinationsConfig,
    #[serde(default)]
    pub mirrors: Vec<RootConfig>,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Producing host, embedded in artifact names
    #[serde(default = "default_host_id")]
    pub host_id: String,

    /// Snapshot state, catalog, ledger, locks
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// One logical source tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub path: PathBuf,
    /// File or directory names skipped at any depth
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationsConfig {
    /// Free space a primary root must keep after the write check
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,

    /// Primary candidates, highest priority first
    #[serde(default)]
    pub roots: Vec<RootConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootConfig {
    pub id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub removable: bool,
    /// Expected label of a removable medium
    #[serde(default)]
    pub medium_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// zstd or none
    #[serde(default = "default_compression")]
    pub compression: String,

    /// 1-22 for zstd
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_keep_days")]
    pub keep_days: u32,

    /// Chains always kept, newest first
    #[serde(default = "default_keep_count")]
    pub keep_count: usize,

    /// Run retention after a backup when the last pass is older than this
    #[serde(default = "default_auto_interval_hours")]
    pub auto_interval_hours: u64,

    /// Re-hash mirror copies before trusting their delivery records
    #[serde(default)]
    pub reverify_mirrors: bool,

    /// Mirrors follow the primaries' retention; `false` keeps every
    /// mirrored copy forever
    #[serde(default = "default_true")]
    pub prune_mirrors: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandoffConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Mount point of the removable medium
    #[serde(default)]
    pub medium: Option<PathBuf>,

    #[serde(default)]
    pub medium_id: Option<String>,

    /// This side's identity; importers acknowledge under it
    #[serde(default)]
    pub identity: Option<String>,

    /// Every consuming side that must acknowledge before the medium is pruned
    #[serde(default)]
    pub importers: Vec<String>,

    /// Export automatically after each backup run
    #[serde(default)]
    pub export_after_backup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Artifacts larger than this are never delta-encoded
    #[serde(default = "default_max_delta_bytes")]
    pub max_delta_bytes: u64,

    /// Relative size difference still considered "similar"
    #[serde(default = "default_size_tolerance")]
    pub size_tolerance: f64,

    /// A delta is kept only if smaller than this fraction of the target
    #[serde(default = "default_max_delta_ratio")]
    pub max_delta_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_host_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine")
}

fn default_min_free_bytes() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_compression() -> String {
    "zstd".to_string()
}

fn default_compression_level() -> i32 {
    3
}

fn default_max_parallel() -> usize {
    2
}

fn default_keep_days() -> u32 {
    30
}

fn default_keep_count() -> usize {
    3
}

fn default_auto_interval_hours() -> u64 {
    24
}

fn default_true() -> bool {
    true
}

fn default_max_delta_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_size_tolerance() -> f64 {
    0.10
}

fn default_max_delta_ratio() -> f64 {
    0.5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_id: default_host_id(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for DestinationsConfig {
    fn default() -> Self {
        Self {
            min_free_bytes: default_min_free_bytes(),
            roots: Vec::new(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            compression_level: default_compression_level(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_days: default_keep_days(),
            keep_count: default_keep_count(),
            auto_interval_hours: default_auto_interval_hours(),
            reverify_mirrors: false,
            prune_mirrors: true,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_delta_bytes: default_max_delta_bytes(),
            size_tolerance: default_size_tolerance(),
            max_delta_ratio: default_max_delta_ratio(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl HandoffConfig {
    /// Identity used for exports and acknowledgements.
    pub fn identity_or(&self, host_id: &str) -> String {
        self.identity.clone().unwrap_or_else(|| host_id.to_string())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&content).map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// File (if any), then `.env` and process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the recognised environment overrides. Unknown variables are
    /// ignored; malformed values are configuration errors.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("BACKUP_HOST_ID") {
            self.engine.host_id = host;
        }
        if let Some(dir) = lookup("BACKUP_STATE_DIR") {
            self.engine.state_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("BACKUP_SOURCE") {
            let id = lookup("BACKUP_SOURCE_ID").unwrap_or_else(|| "default".to_string());
            self.sources.retain(|s| s.id != id);
            self.sources.push(SourceConfig {
                id,
                path: PathBuf::from(path),
                exclude: Vec::new(),
            });
        }
        if let Some(list) = lookup("BACKUP_DESTINATIONS") {
            self.destinations.roots = list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .enumerate()
                .map(|(i, p)| RootConfig {
                    id: format!("dest-{}", i + 1),
                    path: PathBuf::from(p),
                    removable: false,
                    medium_id: None,
                })
                .collect();
        }
        if let Some(bytes) = lookup("BACKUP_MIN_FREE_BYTES") {
            self.destinations.min_free_bytes = parse_env("BACKUP_MIN_FREE_BYTES", &bytes)?;
        }
        if let Some(days) = lookup("BACKUP_KEEP_DAYS") {
            self.retention.keep_days = parse_env("BACKUP_KEEP_DAYS", &days)?;
        }
        if let Some(count) = lookup("BACKUP_KEEP_COUNT") {
            self.retention.keep_count = parse_env("BACKUP_KEEP_COUNT", &count)?;
        }
        if let Some(medium) = lookup("BACKUP_HANDOFF_MEDIUM") {
            self.handoff.medium = Some(PathBuf::from(medium));
        }
        if let Some(identity) = lookup("BACKUP_HANDOFF_IDENTITY") {
            self.handoff.identity = Some(identity);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(EngineError::Config("no sources configured".into()));
        }
        let mut ids = HashSet::new();
        for source in &self.sources {
            if source.id.is_empty() || source.id.contains(['/', '\\']) || source.id.starts_with('.') {
                return Err(EngineError::Config(format!("invalid source id '{}'", source.id)));
            }
            if !ids.insert(source.id.as_str()) {
                return Err(EngineError::Config(format!("duplicate source id '{}'", source.id)));
            }
        }

        if self.destinations.roots.is_empty() {
            return Err(EngineError::Config("no destination roots configured".into()));
        }
        let mut root_ids = HashSet::new();
        for root in self.destinations.roots.iter().chain(&self.mirrors) {
            if !root_ids.insert(root.id.as_str()) {
                return Err(EngineError::Config(format!("duplicate destination id '{}'", root.id)));
            }
        }

        if self.retention.keep_count == 0 {
            return Err(EngineError::Config("retention.keep_count must be at least 1".into()));
        }
        if self.replication.max_parallel == 0 {
            return Err(EngineError::Config("replication.max_parallel must be at least 1".into()));
        }
        if !matches!(self.archive.compression.as_str(), "zstd" | "none") {
            return Err(EngineError::Config(format!(
                "unknown compression '{}' (expected zstd or none)",
                self.archive.compression
            )));
        }
        if !(1..=22).contains(&self.archive.compression_level) {
            return Err(EngineError::Config("archive.compression_level must be 1-22".into()));
        }
        if !(0.0..=1.0).contains(&self.dedup.size_tolerance) || !(0.0..=1.0).contains(&self.dedup.max_delta_ratio) {
            return Err(EngineError::Config("dedup tolerances must be between 0 and 1".into()));
        }

        if self.handoff.enabled {
            if self.handoff.medium.is_none() {
                return Err(EngineError::Config("handoff enabled without a medium path".into()));
            }
            if self.handoff.importers.is_empty() {
                return Err(EngineError::Config("handoff enabled without importers".into()));
            }
            // Importers and roots share the delivery ledger's id space
            let mut importers = HashSet::new();
            for importer in &self.handoff.importers {
                if root_ids.contains(importer.as_str()) || !importers.insert(importer.as_str()) {
                    return Err(EngineError::Config(format!(
                        "handoff importer '{importer}' collides with another importer or destination id"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn source(&self, id: &str) -> Result<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| EngineError::Config(format!("unknown source '{id}'")))
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.id.clone()).collect()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{key}: invalid value '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
        [engine]
        host_id = "vault01"
        state_dir = "/var/lib/backup-engine"

        [[sources]]
        id = "projects"
        path = "/srv/projects"
        exclude = ["node_modules", ".cache"]

        [destinations]
        min_free_bytes = 1048576
        roots = [
            { id = "nas", path = "/mnt/nas" },
            { id = "usb", path = "/media/usb", removable = true, medium_id = "usb-01" },
        ]

        [[mirrors]]
        id = "offsite"
        path = "/mnt/offsite"

        [retention]
        keep_days = 14
        keep_count = 2

        [handoff]
        enabled = true
        medium = "/media/handoff"
        importers = ["work", "home"]
    "#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.engine.host_id, "vault01");
        assert_eq!(config.sources[0].exclude.len(), 2);
        assert_eq!(config.destinations.roots.len(), 2);
        assert!(config.destinations.roots[1].removable);
        assert_eq!(config.mirrors[0].id, "offsite");
        assert_eq!(config.retention.keep_count, 2);
        assert_eq!(config.retention.auto_interval_hours, 24);
        assert_eq!(config.dedup.max_delta_bytes, 64 * 1024 * 1024);
        assert_eq!(config.archive.compression, "zstd");
    }

    #[test]
    fn test_env_overrides() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("BACKUP_DESTINATIONS", "/mnt/a, /mnt/b"),
            ("BACKUP_KEEP_DAYS", "7"),
            ("BACKUP_SOURCE", "/home/me"),
            ("BACKUP_SOURCE_ID", "home"),
            ("LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        config.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.destinations.roots.len(), 2);
        assert_eq!(config.destinations.roots[1].id, "dest-2");
        assert_eq!(config.destinations.roots[1].path, PathBuf::from("/mnt/b"));
        assert_eq!(config.retention.keep_days, 7);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_malformed_env_value_is_config_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(|k| (k == "BACKUP_KEEP_COUNT").then(|| "many".to_string()))
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_validation_rejects() {
        let base: Config = toml::from_str(SAMPLE).unwrap();

        let mut c = base.clone();
        c.sources.push(c.sources[0].clone());
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.destinations.roots.clear();
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.retention.keep_count = 0;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.handoff.importers.clear();
        assert!(matches!(c.validate(), Err(EngineError::Config(_))));

        let mut c = base.clone();
        c.mirrors[0].id = "nas".into();
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.handoff.importers = vec!["work".into(), "work".into()];
        assert!(matches!(c.validate(), Err(EngineError::Config(_))));

        let mut c = base;
        c.handoff.importers = vec!["work".into(), c.mirrors[0].id.clone()];
        assert!(matches!(c.validate(), Err(EngineError::Config(_))));
    }
}
