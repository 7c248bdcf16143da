use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DashboardConfig {
    pub api: ApiConf,
    pub push: PushConf,
    pub poll: PollConf,
    pub history: HistoryConf,
    pub storage: StorageConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConf {
    pub base_url: String, // ex: "https://ops.example.com/api"
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PushConf {
    pub broker_host: String,
    pub broker_port: u16,
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
    pub reconnect_delay_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PollConf {
    pub interval_secs: u64,
    pub incident_limit: u32,
    pub alert_limit: u32,
    pub synthetics_window_hours: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConf {
    pub interval_secs: u64,
    pub capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageConf {
    pub path: Option<PathBuf>,
}

impl Default for ApiConf {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".into(),
            timeout_secs: 15,
        }
    }
}

impl Default for PushConf {
    fn default() -> Self {
        Self {
            broker_host: "localhost".into(),
            broker_port: 1883,
            topic_prefix: "opsboard/events".into(),
            keep_alive_secs: 15,
            reconnect_delay_secs: 2,
        }
    }
}

impl Default for PollConf {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            incident_limit: 50,
            alert_limit: 100,
            synthetics_window_hours: 24,
        }
    }
}

impl Default for HistoryConf {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            capacity: 36,
        }
    }
}

impl PollConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl HistoryConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl DashboardConfig {
    /// Emplacement du fichier d'état local : config explicite, sinon `<data_dir>/opsboard/state.json`
    pub fn storage_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.storage.path {
            return Ok(path.clone());
        }
        let mut path = dirs::data_dir().ok_or(ConfigError::NoDataDir)?;
        path.push("opsboard");
        path.push("state.json");
        Ok(path)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("OPSBOARD_API_URL") {
            if !url.trim().is_empty() {
                self.api.base_url = url;
            }
        }
    }
}

pub async fn load_config_from(path: impl AsRef<Path>) -> Result<DashboardConfig, ConfigError> {
    let txt = fs::read_to_string(path.as_ref()).await?;
    if txt.trim().is_empty() {
        return Ok(DashboardConfig::default());
    }
    Ok(serde_yaml::from_str(&txt)?)
}

/// Charge `OPSBOARD_CONFIG` (défaut `opsboard.yaml`) ; toute erreur retombe sur les défauts
pub async fn load_config() -> DashboardConfig {
    let path = std::env::var("OPSBOARD_CONFIG").unwrap_or_else(|_| "opsboard.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        load_config_from(&path).await.unwrap_or_else(|e| {
            warn!(path = %path, error = %e, "invalid config, using defaults");
            DashboardConfig::default()
        })
    } else {
        info!(path = %path, "no config file, using defaults");
        DashboardConfig::default()
    };
    cfg.apply_env_overrides();
    cfg
}
