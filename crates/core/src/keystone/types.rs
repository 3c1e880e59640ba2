//! Types for the update engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::CommandError;
use crate::fetch::FetchError;
use crate::server::ServerError;
use crate::ticket::TicketError;

/// Errors returned by [`Keystone`](super::Keystone) operations.
#[derive(Debug, Error)]
pub enum KeystoneError {
    /// A run is already in progress.
    #[error("an update run is already in progress")]
    AlreadyUpdating,

    /// No ticket exists for the product.
    #[error("no ticket for product: {0}")]
    UnknownProduct(String),

    /// Ticket store error.
    #[error("ticket store error: {0}")]
    TicketStore(#[from] TicketError),
}

/// Errors raised inside individual actions. They are logged and turned into
/// an unsuccessful completion; they never cross the action boundary.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("command failed: {0}")]
    Command(#[from] CommandError),

    #[error("download returned HTTP {0}")]
    DownloadStatus(u16),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing input: {0}")]
    MissingInput(&'static str),
}

/// Identification sent to update servers with every check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoneParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Release channel tag, e.g. "beta".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_check_tag: Option<String>,
    /// Machine-wide installation rather than per-user.
    #[serde(default)]
    pub is_machine: bool,
}

/// Snapshot of the engine's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeystoneStatus {
    pub updating: bool,
    pub current_action: Option<String>,
    pub queued_actions: usize,
    pub actions_completed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_skip_unset_fields() {
        let params = KeystoneParams {
            os_version: Some("6.8".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"os_version":"6.8","is_machine":false}"#);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            KeystoneError::AlreadyUpdating.to_string(),
            "an update run is already in progress"
        );
        let err = ActionError::SizeMismatch {
            expected: 10,
            actual: 4,
        };
        assert_eq!(err.to_string(), "size mismatch: expected 10 bytes, got 4");
    }
}
