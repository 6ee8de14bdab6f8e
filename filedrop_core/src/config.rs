use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "filedrop";
const APP_NAME: &str = "filedrop";
const CONFIG_FILE: &str = "config.json";

/// Overrides the config directory (used by tests)
pub const CONFIG_DIR_ENV: &str = "FILEDROP_CONFIG_DIR";
/// Overrides `accept_timeout_secs`
pub const ACCEPT_TIMEOUT_ENV: &str = "FILEDROP_ACCEPT_TIMEOUT";

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where received files are written
    pub download_path: PathBuf,
    /// STUN servers used for candidate gathering (no TURN relay)
    pub stun_servers: Vec<String>,
    /// Rendezvous polling interval
    pub poll_interval_ms: u64,
    /// How long a sender waits for accept/decline
    pub accept_timeout_secs: u64,
    /// Session code lifetime
    pub session_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let download_path = directories::UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
            .or_else(|| directories::UserDirs::new().map(|dirs| dirs.home_dir().to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("filedrop");

        Self {
            download_path,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            poll_interval_ms: 1000,
            accept_timeout_secs: 30,
            session_ttl_secs: 10 * 60,
        }
    }
}

impl AppConfig {
    /// Get the config file path
    fn get_config_path() -> Option<PathBuf> {
        get_config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Load config from disk or return default.
    ///
    /// A `.env` file in the working directory is read first so that the
    /// environment overrides below can live there.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();

        let mut config = match Self::get_config_path() {
            Some(path) => match fs::read_to_string(&path) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                    tracing::warn!("Ignoring malformed config {:?}: {}", path, e);
                    Self::default()
                }),
                Err(_) => Self::default(),
            },
            None => Self::default(),
        };

        if let Some(secs) = std::env::var(ACCEPT_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.accept_timeout_secs = secs;
        }

        config
    }

    /// Save config to disk
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::get_config_path()
            .ok_or_else(|| anyhow::anyhow!("No config directory available"))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Get the config directory path for this app
pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(test_path) = std::env::var(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(test_path));
    }

    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}
