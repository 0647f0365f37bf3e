use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::DB_FILE;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: String,
    /// Seconds between scheduler ticks.
    pub tick_interval_secs: u64,
    /// Upper bound on connections syncing at once.
    pub max_workers: usize,
    /// Upper bound on a single scraper invocation.
    pub adapter_timeout_secs: u64,
    /// Directory holding one scraper executable per institution slug.
    /// Defaults to `<data_dir>/scrapers`.
    pub scraper_dir: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().to_string(),
            tick_interval_secs: 300,
            max_workers: 4,
            adapter_timeout_secs: 120,
            scraper_dir: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Settings {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(DB_FILE)
    }

    pub fn scraper_dir(&self) -> PathBuf {
        match &self.scraper_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(&self.data_dir).join("scrapers"),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs.max(1))
    }

    /// A `running` lock older than this is considered abandoned.
    pub fn lock_lease(&self) -> Duration {
        crate::scheduler::lock_lease(self.adapter_timeout())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(SyncError::Settings("max_workers must be at least 1".into()));
        }
        if self.data_dir.trim().is_empty() {
            return Err(SyncError::Settings("data_dir is empty".into()));
        }
        Ok(())
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("ledgersync")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("ledgersync")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    settings.validate()?;
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| SyncError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn shellexpand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .to_string_lossy()
        .to_string()
}
