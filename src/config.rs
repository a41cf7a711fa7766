//! Settings file plus environment overrides.
//!
//! `<data_dir>/hearthkeep.json` is optional; every field has a default.
//! Environment variables win over the file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::DB_FILE_NAME;

pub const CONFIG_FILE_NAME: &str = "hearthkeep.json";
pub const APP_DIR_NAME: &str = "hearthkeep";

pub const ENV_DATA_DIR: &str = "HEARTHKEEP_DATA_DIR";
pub const ENV_REMOTE_URL: &str = "HEARTHKEEP_REMOTE_URL";
pub const ENV_DEBOUNCE_MS: &str = "HEARTHKEEP_SYNC_DEBOUNCE_MS";
pub const ENV_PUSH_BATCH: &str = "HEARTHKEEP_PUSH_BATCH";
pub const ENV_INTERVAL_SECS: &str = "HEARTHKEEP_SYNC_INTERVAL_SECS";
pub const ENV_LOG: &str = "HEARTHKEEP_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Non-forced syncs within this window of the last success are skipped.
    pub debounce_ms: u64,
    /// Trigger requests arriving within this delay share one run.
    pub trigger_delay_ms: u64,
    pub push_batch_size: usize,
    /// Keep-fresh timer period; 0 disables it.
    pub interval_secs: u64,
    pub remote_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 30_000,
            trigger_delay_ms: 500,
            push_batch_size: 25,
            interval_secs: 300,
            remote_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
    /// Write JSON logs under `<data_dir>/logs` in addition to stderr.
    pub file: bool,
    pub file_max_bytes: usize,
    pub file_max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "hearthkeep=info,sqlx=warn".to_string(),
            file: true,
            file_max_bytes: 5 * 1024 * 1024,
            file_max_files: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Database file outside the data directory.
    #[serde(skip)]
    pub db_file: Option<PathBuf>,
    pub sync: SyncConfig,
    pub log: LogConfig,
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

impl AppConfig {
    /// Load from the process environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load with an explicit variable lookup.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let data_dir = env(ENV_DATA_DIR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let mut config = Self::read_file(&data_dir)?;
        config.data_dir = data_dir;
        config.apply_env(env);
        Ok(config)
    }

    fn read_file(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(url) = env(ENV_REMOTE_URL).filter(|v| !v.trim().is_empty()) {
            self.sync.remote_url = Some(url);
        }
        if let Some(ms) = parse_env(&env, ENV_DEBOUNCE_MS) {
            self.sync.debounce_ms = ms;
        }
        if let Some(batch) = parse_env::<usize>(&env, ENV_PUSH_BATCH) {
            self.sync.push_batch_size = batch.max(1);
        }
        if let Some(secs) = parse_env(&env, ENV_INTERVAL_SECS) {
            self.sync.interval_secs = secs;
        }
        if let Some(filter) = env(ENV_LOG).filter(|v| !v.trim().is_empty()) {
            self.log.filter = filter;
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DB_FILE_NAME))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn parse_env<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(target: "hearthkeep", event = "config_env_ignored", key, value = %raw);
            None
        }
    }
}
