//! Testing utilities and mock implementations.
//!
//! This module provides doubles for every collaborator of the engine, so a
//! whole update run can be exercised without network access or real
//! installers.
//!
//! # Example
//!
//! ```rust,ignore
//! use keystone_core::testing::{fixtures, MockCommandRunner, MockFetcherFactory, RecordingDelegate};
//!
//! let runner = MockCommandRunner::new();
//! let delegate = RecordingDelegate::new(Arc::new(runner.clone()));
//! let fetchers = MockFetcherFactory::always_finish_with_data(
//!     fixtures::updates_body(&[fixtures::update_info("com.example.app")]),
//! );
//!
//! // Build a Keystone with these and run it...
//!
//! let finished = delegate.wait_for_finished_runs(1).await;
//! assert_eq!(finished, vec![true]);
//! ```

mod mock_command_runner;
mod mock_fetcher;
mod recording_delegate;
mod test_action;

pub use mock_command_runner::{MockCommandRunner, RecordedCommand};
pub use mock_fetcher::{MockFetcherFactory, MockResponse};
pub use recording_delegate::{Decision, DelegateCall, RecordingDelegate};
pub use test_action::{ActionLog, TestAction, TestBehavior};

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::keystone::actions::sha256_hex;
    use crate::ticket::{ExistenceChecker, Ticket};
    use crate::update::UpdateInfo;

    /// A ticket for an installed product (its existence checker points at
    /// `/`).
    pub fn ticket(product_id: &str, server_url: &str) -> Ticket {
        Ticket::new(product_id, "1.0", ExistenceChecker::path("/"), server_url)
            .unwrap_or_else(|e| panic!("invalid fixture ticket {}: {}", product_id, e))
    }

    /// A ticket whose product is not installed.
    pub fn uninstalled_ticket(product_id: &str, server_url: &str) -> Ticket {
        Ticket::new(product_id, "1.0", ExistenceChecker::Never, server_url)
            .unwrap_or_else(|e| panic!("invalid fixture ticket {}: {}", product_id, e))
    }

    /// An update with an unverified payload.
    pub fn update_info(product_id: &str) -> UpdateInfo {
        let mut info = UpdateInfo::new(product_id, payload_url(product_id));
        info.display_version = Some("2.0".to_string());
        info
    }

    /// An update whose size and hash match `payload`.
    pub fn update_info_for_payload(product_id: &str, payload: &[u8]) -> UpdateInfo {
        let mut info = update_info(product_id);
        info.code_size = payload.len() as u64;
        info.code_hash = sha256_hex(payload);
        info
    }

    /// Where fixture updates download their payload from.
    pub fn payload_url(product_id: &str) -> String {
        format!("https://dl.example.com/{}.sh", product_id)
    }

    /// Body of a JSON update check response.
    pub fn updates_body(updates: &[UpdateInfo]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({ "updates": updates }))
            .unwrap_or_else(|e| panic!("unencodable fixture updates: {}", e))
    }
}
