use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const HEUREKA_DIR_NAME: &str = ".heureka";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const LOCKS_DIR_NAME: &str = "locks";
pub const DEFAULT_DATABASE_PATH: &str = ".heureka/heureka.sqlite";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SYSTEM_USER_ID: i64 = 1;
pub const DEFAULT_TAG_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HeurekaConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Relative paths resolve against the workspace root.
    #[serde(default = "default_database_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn resolve_path(&self, workspace_root: impl AsRef<Path>) -> PathBuf {
        let path = Path::new(&self.path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            workspace_root.as_ref().join(path)
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_system_user_id")]
    pub system_user_id: i64,
    /// Upper bound for one tag's transaction. Zero disables the deadline.
    #[serde(default = "default_tag_timeout_ms")]
    pub tag_timeout_ms: u64,
    /// Skip a tag that fails with a retryable error instead of aborting the
    /// whole pass.
    #[serde(default)]
    pub isolate_tag_failures: bool,
    #[serde(default = "default_true")]
    pub autopatch_on_complete: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            system_user_id: default_system_user_id(),
            tag_timeout_ms: default_tag_timeout_ms(),
            isolate_tag_failures: false,
            autopatch_on_complete: true,
        }
    }
}

impl ReconcileConfig {
    pub fn tag_timeout(&self) -> Option<Duration> {
        (self.tag_timeout_ms > 0).then(|| Duration::from_millis(self.tag_timeout_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Human,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn heureka_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(HEUREKA_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    heureka_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn locks_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    heureka_dir(workspace_root).join(LOCKS_DIR_NAME)
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<HeurekaConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(HeurekaConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: HeurekaConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<HeurekaConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(heureka_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = HeurekaConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

pub fn validate_config(config: &HeurekaConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.database.busy_timeout_ms == 0 {
        warnings.push(ConfigWarning {
            code: "database_busy_timeout_zero",
            message: "database.busy_timeout_ms is 0; concurrent writers will fail immediately with SQLITE_BUSY".to_owned(),
        });
    }
    if config.reconcile.system_user_id <= 0 {
        warnings.push(ConfigWarning {
            code: "reconcile_system_user_invalid",
            message: format!(
                "reconcile.system_user_id must be positive, got {}",
                config.reconcile.system_user_id
            ),
        });
    }
    if config.reconcile.tag_timeout_ms == 0 {
        warnings.push(ConfigWarning {
            code: "reconcile_tag_timeout_disabled",
            message: "reconcile.tag_timeout_ms is 0; tag transactions run without a deadline"
                .to_owned(),
        });
    }

    warnings
}

fn default_database_path() -> String {
    DEFAULT_DATABASE_PATH.to_owned()
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_system_user_id() -> i64 {
    DEFAULT_SYSTEM_USER_ID
}

fn default_tag_timeout_ms() -> u64 {
    DEFAULT_TAG_TIMEOUT_MS
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_owned()
}

fn default_true() -> bool {
    true
}

fn normalize_config(mut config: HeurekaConfig) -> HeurekaConfig {
    let path = config.database.path.trim();
    if path.is_empty() {
        config.database.path = default_database_path();
    } else {
        config.database.path = path.to_owned();
    }

    let level = config.logging.level.trim();
    if level.is_empty() {
        config.logging.level = default_log_level();
    } else {
        config.logging.level = level.to_ascii_lowercase();
    }

    config
}
