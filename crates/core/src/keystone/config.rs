//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{default_download_dir, Config};

/// Runtime settings for a [`Keystone`](super::Keystone).
#[derive(Debug, Clone)]
pub struct KeystoneConfig {
    /// Where payloads are downloaded and cached.
    pub download_dir: PathBuf,
    /// Terminate and fail any single action running longer than this.
    pub action_timeout: Option<Duration>,
}

impl Default for KeystoneConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(false),
            action_timeout: None,
        }
    }
}

impl From<&Config> for KeystoneConfig {
    fn from(config: &Config) -> Self {
        Self {
            download_dir: config.download_dir(),
            action_timeout: config.engine.action_timeout(),
        }
    }
}
