use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitor::MonitorSettings;
use crate::presence::PresenceSettings;
use crate::source::{PlayerTarget, SourceConfig, SourceRole};

/// Overrides the base directory (portable mode)
const ENV_BASE_DIR: &str = "TUNESYNC_HOME";

const POLL_INTERVAL_RANGE: (u64, u64) = (250, 10_000);
const QUERY_TIMEOUT_RANGE: (u64, u64) = (100, 10_000);
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the config directory (no valid home directory)")]
    NoHome,

    #[error("could not access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Where settings and logs live.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub log_dir: PathBuf,
}

impl ConfigPaths {
    pub fn new() -> Result<Self, ConfigError> {
        if let Ok(base) = env::var(ENV_BASE_DIR) {
            return Ok(Self::in_dir(Path::new(&base)));
        }

        let proj = ProjectDirs::from("dev", "TuneSync", "tunesync").ok_or(ConfigError::NoHome)?;
        let config_dir = proj.config_dir().to_path_buf();
        Ok(Self {
            config_file: config_dir.join("config.json"),
            config_dir,
            log_dir: proj.data_dir().join("logs"),
        })
    }

    /// Everything under one directory
    pub fn in_dir(base: &Path) -> Self {
        Self {
            config_dir: base.to_path_buf(),
            config_file: base.join("config.json"),
            log_dir: base.join("logs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub poll_interval_ms: u64,
    /// Upper bound for a single player query
    pub query_timeout_ms: u64,
    /// Query order; the first source reporting a track wins
    pub sources: Vec<SourceConfig>,
    pub presence: PresenceSettings,
    pub check_for_updates: bool,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            query_timeout_ms: 2000,
            sources: default_sources(),
            presence: PresenceSettings::default(),
            check_for_updates: true,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(target_os = "windows")]
fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::new(SourceRole::Primary, PlayerTarget::App("iTunes".into())),
        SourceConfig::new(SourceRole::Secondary, PlayerTarget::App("AppleMusic".into())),
    ]
}

#[cfg(target_os = "macos")]
fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::new(SourceRole::Primary, PlayerTarget::App("Music".into())),
        SourceConfig::new(SourceRole::Secondary, PlayerTarget::App("iTunes".into())),
    ]
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::new(SourceRole::Primary, PlayerTarget::App("Cider".into())),
        SourceConfig::new(SourceRole::Secondary, PlayerTarget::AnyActive),
    ]
}

impl AppConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            poll_interval: self.poll_interval(),
        }
    }

    /// Pulls hand-edited values back into range.
    fn sanitized(mut self) -> Self {
        self.poll_interval_ms = self.poll_interval_ms.clamp(POLL_INTERVAL_RANGE.0, POLL_INTERVAL_RANGE.1);
        self.query_timeout_ms = self.query_timeout_ms.clamp(QUERY_TIMEOUT_RANGE.0, QUERY_TIMEOUT_RANGE.1);

        let level = self.log_level.trim().to_ascii_lowercase();
        self.log_level = if LOG_LEVELS.contains(&level.as_str()) {
            level
        } else {
            "info".to_string()
        };
        self
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config.sanitized())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(io_err)
    }

    /// Never fails. A missing file is created with defaults; an unreadable
    /// or invalid one is left alone and defaults are used. Any problem is
    /// handed back so it can be logged once logging is up.
    pub fn load_or_default(path: &Path) -> (Self, Option<ConfigError>) {
        if !path.exists() {
            let config = Self::default();
            let problem = config.save(path).err();
            return (config, problem);
        }

        match Self::load(path) {
            Ok(config) => (config, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }
}
