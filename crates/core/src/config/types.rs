use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::keystone::KeystoneParams;
use crate::ticket::default_ticket_store_path;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub downloads: DownloadsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub params: KeystoneParams,
}

impl Config {
    /// Ticket store location, honouring the machine-wide flag.
    pub fn ticket_store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| default_ticket_store_path(self.params.is_machine))
    }

    /// Download directory, honouring the machine-wide flag.
    pub fn download_dir(&self) -> PathBuf {
        self.downloads
            .dir
            .clone()
            .unwrap_or_else(|| default_download_dir(self.params.is_machine))
    }
}

/// Ticket store configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Explicit store file. Defaults to the per-user or machine-wide path.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Download cache configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DownloadsConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// HTTP client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Request timeout in seconds (default: 60)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("keystone/{}", env!("CARGO_PKG_VERSION"))
}

/// Action engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Fail any single action that runs longer than this. Unlimited if unset.
    #[serde(default)]
    pub action_timeout_secs: Option<u64>,
}

impl EngineConfig {
    pub fn action_timeout(&self) -> Option<Duration> {
        self.action_timeout_secs.map(Duration::from_secs)
    }
}

/// Default download directory for per-user or machine-wide installs.
pub fn default_download_dir(is_machine: bool) -> PathBuf {
    if is_machine {
        return PathBuf::from("/var/cache/keystone/Downloads");
    }
    match home::home_dir() {
        Some(home) => home.join(".cache/keystone/Downloads"),
        None => std::env::temp_dir().join("keystone-downloads"),
    }
}
