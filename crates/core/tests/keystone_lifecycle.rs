//! Keystone lifecycle integration tests.
//!
//! These tests drive complete update runs through the engine:
//! check -> prefetch -> silent update -> prompted update -> finished

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use keystone_core::{
    keystone::actions::payload_path,
    testing::{
        fixtures, Decision, DelegateCall, MockCommandRunner, MockFetcherFactory, MockResponse,
        RecordingDelegate,
    },
    JsonServerFactory, Keystone, KeystoneBroker, KeystoneConfig, KeystoneError, KeystoneStats,
    SqliteTicketStore, TicketStore, UpdateInfo,
};

const SERVER_X: &str = "https://x.example.com/check";
const SERVER_Y: &str = "https://y.example.com/check";
const PAYLOAD: &[u8] = b"#!/bin/sh\necho \"$2\"\n";

/// Test helper to create all dependencies for engine testing.
struct TestHarness {
    store: Arc<SqliteTicketStore>,
    runner: MockCommandRunner,
    _temp_dir: TempDir,
    download_dir: std::path::PathBuf,
}

impl TestHarness {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(
            SqliteTicketStore::new(&temp_dir.path().join("Keystone.ticketstore"))
                .expect("Failed to create ticket store"),
        );
        let download_dir = temp_dir.path().join("downloads");

        Self {
            store,
            runner: MockCommandRunner::new(),
            _temp_dir: temp_dir,
            download_dir,
        }
    }

    fn add_ticket(&self, product_id: &str, server_url: &str) {
        self.store
            .store_ticket(&fixtures::ticket(product_id, server_url))
            .expect("Failed to store ticket");
    }

    fn delegate(&self) -> RecordingDelegate {
        RecordingDelegate::new(Arc::new(self.runner.clone()))
    }

    fn keystone(&self, delegate: &RecordingDelegate, fetchers: &MockFetcherFactory) -> Keystone {
        self.keystone_with_timeout(delegate, fetchers, Duration::from_secs(10))
    }

    fn keystone_with_timeout(
        &self,
        delegate: &RecordingDelegate,
        fetchers: &MockFetcherFactory,
        action_timeout: Duration,
    ) -> Keystone {
        Keystone::new(
            KeystoneConfig {
                download_dir: self.download_dir.clone(),
                action_timeout: Some(action_timeout),
            },
            self.store.clone(),
            Arc::new(delegate.clone()),
            Arc::new(fetchers.clone()),
            Arc::new(JsonServerFactory),
        )
    }
}

/// Fetchers serving `updates` from `server` plus every payload.
fn serving(routes: &[(&str, Vec<UpdateInfo>)]) -> MockFetcherFactory {
    let mut fetchers = MockFetcherFactory::always_fail_with_error("no route");
    for (server, updates) in routes {
        fetchers = fetchers.with_route(*server, MockResponse::data(fixtures::updates_body(updates)));
        for update in updates {
            fetchers = fetchers.with_route(update.codebase_url.clone(), MockResponse::data(PAYLOAD.to_vec()));
        }
    }
    fetchers
}

async fn finished_runs(delegate: &RecordingDelegate, n: usize) -> Vec<bool> {
    tokio::time::timeout(Duration::from_secs(10), delegate.wait_for_finished_runs(n))
        .await
        .expect("Timed out waiting for the run to finish")
}

#[tokio::test]
async fn test_update_available_on_one_of_two_servers() {
    let harness = TestHarness::new();
    harness.add_ticket("A", SERVER_X);
    harness.add_ticket("B", SERVER_Y);

    let update_a = fixtures::update_info_for_payload("A", PAYLOAD);
    let fetchers = serving(&[(SERVER_X, vec![update_a.clone()]), (SERVER_Y, vec![])]);
    let delegate = harness
        .delegate()
        .with_prefetch(Decision::None)
        .with_silent(Decision::None)
        .with_prompt(Decision::All);
    let ks = harness.keystone(&delegate, &fetchers);

    ks.update_all_products().unwrap();
    assert_eq!(finished_runs(&delegate, 1).await, vec![true]);

    assert_eq!(
        delegate.calls(),
        vec![
            DelegateCall::Started,
            DelegateCall::ShouldPrefetch(vec!["A".to_string()]),
            DelegateCall::ShouldSilentlyUpdate(vec!["A".to_string()]),
            DelegateCall::ShouldUpdate(vec!["A".to_string()]),
            DelegateCall::UpdateStarting("A".to_string()),
            DelegateCall::UpdateFinished {
                product_id: "A".to_string(),
                success: true,
                wants_reboot: false,
            },
            DelegateCall::Finished(true),
        ]
    );
    assert_eq!(harness.runner.installed_products().await, vec!["A"]);
    assert_eq!(delegate.runner_requests(), 1);
    assert!(payload_path(&harness.download_dir, &update_a).exists());
    assert!(!ks.is_updating());
}

#[tokio::test]
async fn test_one_server_down_still_succeeds() {
    let harness = TestHarness::new();
    harness.add_ticket("A", SERVER_X);
    harness.add_ticket("B", SERVER_Y);

    let fetchers = serving(&[(SERVER_X, vec![fixtures::update_info_for_payload("A", PAYLOAD)])]);
    let delegate = harness.delegate();
    let ks = harness.keystone(&delegate, &fetchers);

    ks.update_all_products().unwrap();

    assert_eq!(finished_runs(&delegate, 1).await, vec![true]);
    assert_eq!(harness.runner.installed_products().await, vec!["A"]);
}

#[tokio::test]
async fn test_all_servers_down_reports_failure() {
    let harness = TestHarness::new();
    harness.add_ticket("A", SERVER_X);
    harness.add_ticket("B", SERVER_Y);

    let fetchers = MockFetcherFactory::always_fail_with_error("unreachable");
    let delegate = harness.delegate();
    let ks = harness.keystone(&delegate, &fetchers);

    ks.update_all_products().unwrap();

    assert_eq!(finished_runs(&delegate, 1).await, vec![false]);
    assert_eq!(
        delegate.calls(),
        vec![DelegateCall::Started, DelegateCall::Finished(false)]
    );
    assert!(harness.runner.recorded_commands().await.is_empty());
}

#[tokio::test]
async fn test_prompt_user_products_skip_silent_stage() {
    let harness = TestHarness::new();
    harness.add_ticket("A", SERVER_X);
    harness.add_ticket("C", SERVER_X);

    let silent = fixtures::update_info_for_payload("A", PAYLOAD);
    let mut prompted = fixtures::update_info_for_payload("C", PAYLOAD);
    prompted.prompt_user = true;
    prompted.require_reboot = true;
    let fetchers = serving(&[(SERVER_X, vec![silent, prompted])]);
    let delegate = harness.delegate();
    let ks = harness.keystone(&delegate, &fetchers);

    ks.update_all_products().unwrap();
    assert_eq!(finished_runs(&delegate, 1).await, vec![true]);

    let calls = delegate.calls();
    assert!(calls.contains(&DelegateCall::ShouldSilentlyUpdate(vec!["A".to_string()])));
    assert!(calls.contains(&DelegateCall::ShouldUpdate(vec!["C".to_string()])));
    assert!(calls.contains(&DelegateCall::UpdateFinished {
        product_id: "C".to_string(),
        success: true,
        wants_reboot: true,
    }));
    assert_eq!(harness.runner.installed_products().await, vec!["A", "C"]);

    let user_initiated: Vec<(String, String)> = harness
        .runner
        .recorded_commands()
        .await
        .into_iter()
        .filter(|c| c.phase() == Some("install"))
        .map(|c| (c.env["KS_PRODUCT_ID"].clone(), c.env["KS_USER_INITIATED"].clone()))
        .collect();
    assert_eq!(
        user_initiated,
        vec![
            ("A".to_string(), "0".to_string()),
            ("C".to_string(), "1".to_string())
        ]
    );
}

#[tokio::test]
async fn test_failed_install_does_not_stop_siblings() {
    let harness = TestHarness::new();
    harness.add_ticket("A", SERVER_X);
    harness.add_ticket("B", SERVER_X);
    harness.runner.set_exit_code_for_product("A", 12).await;

    let fetchers = serving(&[(
        SERVER_X,
        vec![
            fixtures::update_info_for_payload("A", PAYLOAD),
            fixtures::update_info_for_payload("B", PAYLOAD),
        ],
    )]);
    let delegate = harness.delegate();
    let ks = harness.keystone(&delegate, &fetchers);
    let stats = Arc::new(KeystoneStats::new().unwrap());
    ks.set_stats(Some(stats.clone()));

    ks.update_all_products().unwrap();
    assert_eq!(finished_runs(&delegate, 1).await, vec![true]);

    let finished: Vec<(String, bool)> = delegate
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            DelegateCall::UpdateFinished {
                product_id,
                success,
                ..
            } => Some((product_id, success)),
            _ => None,
        })
        .collect();
    assert_eq!(
        finished,
        vec![("A".to_string(), false), ("B".to_string(), true)]
    );
    assert_eq!(stats.install_rc("A"), Some(12));
    assert_eq!(stats.install_rc("B"), Some(0));
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.tickets, 2);
    assert_eq!(snapshot.valid_tickets, 2);
    assert_eq!(snapshot.checks, 1);
}

#[tokio::test]
async fn test_prefetched_payload_is_reused() {
    let harness = TestHarness::new();
    harness.add_ticket("A", SERVER_X);

    let fetchers = serving(&[(SERVER_X, vec![fixtures::update_info_for_payload("A", PAYLOAD)])]);
    let delegate = harness.delegate();
    let ks = harness.keystone(&delegate, &fetchers);
    let stats = Arc::new(KeystoneStats::new().unwrap());
    ks.set_stats(Some(stats.clone()));

    ks.update_all_products().unwrap();
    assert_eq!(finished_runs(&delegate, 1).await, vec![true]);

    let payload_fetches = fetchers
        .recorded_requests()
        .await
        .into_iter()
        .filter(|r| r.url == fixtures::payload_url("A"))
        .count();
    assert_eq!(payload_fetches, 1);
    assert_eq!(stats.snapshot().downloads, 1);
    assert_eq!(stats.snapshot().download_cache_hits, 1);

    // A second run finds the verified payload on disk and fetches only the check.
    fetchers.clear_recorded().await;
    ks.update_all_products().unwrap();
    assert_eq!(finished_runs(&delegate, 2).await, vec![true, true]);

    let urls: Vec<String> = fetchers
        .recorded_requests()
        .await
        .into_iter()
        .map(|r| r.url)
        .collect();
    assert_eq!(urls, vec![SERVER_X]);
    assert_eq!(stats.snapshot().downloads, 1);
    assert_eq!(stats.snapshot().download_cache_hits, 3);
}

#[tokio::test]
async fn test_stalled_payload_does_not_block_sibling_updates() {
    let harness = TestHarness::new();
    harness.add_ticket("A", SERVER_X);
    harness.add_ticket("B", SERVER_X);

    let fetchers = serving(&[(
        SERVER_X,
        vec![
            fixtures::update_info_for_payload("A", PAYLOAD),
            fixtures::update_info_for_payload("B", PAYLOAD),
        ],
    )])
    .with_route(fixtures::payload_url("A"), MockResponse::Hang);
    let delegate = harness.delegate().with_prefetch(Decision::None);
    let ks = harness.keystone_with_timeout(&delegate, &fetchers, Duration::from_millis(300));

    ks.update_all_products().unwrap();
    assert_eq!(finished_runs(&delegate, 1).await, vec![true]);

    let updates: Vec<DelegateCall> = delegate
        .calls()
        .into_iter()
        .filter(|call| {
            matches!(
                call,
                DelegateCall::UpdateStarting(_) | DelegateCall::UpdateFinished { .. }
            )
        })
        .collect();
    assert_eq!(
        updates,
        vec![
            DelegateCall::UpdateStarting("A".to_string()),
            DelegateCall::UpdateFinished {
                product_id: "A".to_string(),
                success: false,
                wants_reboot: false,
            },
            DelegateCall::UpdateStarting("B".to_string()),
            DelegateCall::UpdateFinished {
                product_id: "B".to_string(),
                success: true,
                wants_reboot: false,
            },
        ]
    );
    assert_eq!(harness.runner.installed_products().await, vec!["B"]);
}

#[tokio::test]
async fn test_single_product_update() {
    let harness = TestHarness::new();
    harness.add_ticket("A", SERVER_X);
    harness.add_ticket("B", SERVER_Y);

    let fetchers = serving(&[
        (SERVER_X, vec![fixtures::update_info_for_payload("A", PAYLOAD)]),
        (SERVER_Y, vec![fixtures::update_info_for_payload("B", PAYLOAD)]),
    ]);
    let delegate = harness.delegate();
    let ks = harness.keystone(&delegate, &fetchers);

    ks.update_product_with_product_id("b").unwrap();
    assert_eq!(finished_runs(&delegate, 1).await, vec![true]);

    assert_eq!(harness.runner.installed_products().await, vec!["B"]);
    let servers: Vec<String> = fetchers
        .recorded_requests()
        .await
        .into_iter()
        .map(|r| r.url)
        .filter(|url| url.ends_with("/check"))
        .collect();
    assert_eq!(servers, vec![SERVER_Y]);
}

#[tokio::test]
async fn test_uninstalled_products_are_not_checked() {
    let harness = TestHarness::new();
    harness.add_ticket("A", SERVER_X);
    harness
        .store
        .store_ticket(&fixtures::uninstalled_ticket("Gone", SERVER_Y))
        .unwrap();

    let fetchers = serving(&[(SERVER_X, vec![])]);
    let delegate = harness.delegate();
    let ks = harness.keystone(&delegate, &fetchers);

    ks.update_all_products().unwrap();
    assert_eq!(finished_runs(&delegate, 1).await, vec![true]);

    let urls: Vec<String> = fetchers
        .recorded_requests()
        .await
        .into_iter()
        .map(|r| r.url)
        .collect();
    assert_eq!(urls, vec![SERVER_X]);
}

#[tokio::test]
async fn test_uninstalled_single_product_finishes_successfully() {
    let harness = TestHarness::new();
    harness
        .store
        .store_ticket(&fixtures::uninstalled_ticket("Gone", SERVER_X))
        .unwrap();

    let fetchers = serving(&[(SERVER_X, vec![fixtures::update_info_for_payload("Gone", PAYLOAD)])]);
    let delegate = harness.delegate();
    let ks = harness.keystone(&delegate, &fetchers);

    ks.update_product_with_product_id("gone").unwrap();

    assert_eq!(finished_runs(&delegate, 1).await, vec![true]);
    assert_eq!(
        delegate.calls(),
        vec![DelegateCall::Started, DelegateCall::Finished(true)]
    );
    assert_eq!(fetchers.request_count().await, 0);
    assert!(harness.runner.recorded_commands().await.is_empty());
}

#[tokio::test]
async fn test_stop_and_reset_does_not_report_finished() {
    let harness = TestHarness::new();
    harness.add_ticket("A", SERVER_X);

    let fetchers = MockFetcherFactory::always_hang();
    let delegate = harness.delegate();
    let ks = harness.keystone(&delegate, &fetchers);

    ks.update_all_products().unwrap();
    assert!(matches!(
        ks.update_all_products(),
        Err(KeystoneError::AlreadyUpdating)
    ));

    ks.stop_and_reset();
    tokio::time::timeout(Duration::from_secs(5), ks.wait_until_idle())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!ks.is_updating());
    assert!(delegate.finished_runs().is_empty());

    // A later run against the same store and delegate still reports.
    let fetchers = serving(&[(SERVER_X, vec![])]);
    let ks = harness.keystone(&delegate, &fetchers);
    ks.update_all_products().unwrap();
    assert_eq!(finished_runs(&delegate, 1).await, vec![true]);
}

#[tokio::test]
async fn test_broker_force_unlock_recovers_stuck_engine() {
    let harness = TestHarness::new();
    harness.add_ticket("A", SERVER_X);

    let fetchers = MockFetcherFactory::always_hang();
    let delegate = harness.delegate();
    let broker = KeystoneBroker::new(Arc::new(harness.keystone(&delegate, &fetchers)));

    let stuck = broker.claim_keystone().unwrap();
    stuck.update_all_products().unwrap();
    assert!(broker.claim_keystone().is_none());

    broker.force_unlock();

    let ks = broker.claim_keystone().expect("Engine should be claimable after unlock");
    assert!(!ks.is_updating());
    ks.update_all_products().unwrap();
    assert!(ks.is_updating());
    broker.return_keystone(&ks).unwrap();
}
