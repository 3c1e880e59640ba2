//! Scripted delegate that records every hook call.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

use crate::command::CommandRunner;
use crate::keystone::KeystoneDelegate;
use crate::update::UpdateInfo;

/// How a [`RecordingDelegate`] answers one of the `should_*` hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Accept everything offered.
    All,
    /// Accept nothing.
    None,
    /// Accept these product ids (plus anything else returned, which the
    /// engine ignores).
    Only(Vec<String>),
}

impl Decision {
    fn apply(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        match self {
            Decision::All => products,
            Decision::None => Vec::new(),
            Decision::Only(ids) => products
                .into_iter()
                .filter(|p| ids.iter().any(|id| p.is_for_product(id)))
                .collect(),
        }
    }
}

/// A hook invocation, in the order the engine made them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateCall {
    Started,
    ShouldPrefetch(Vec<String>),
    ShouldSilentlyUpdate(Vec<String>),
    ShouldUpdate(Vec<String>),
    UpdateStarting(String),
    UpdateFinished {
        product_id: String,
        success: bool,
        wants_reboot: bool,
    },
    Finished(bool),
}

fn ids(products: &[UpdateInfo]) -> Vec<String> {
    products.iter().map(|p| p.product_id.clone()).collect()
}

/// Delegate for driving a [`Keystone`](crate::keystone::Keystone) in tests.
///
/// Clones share the call log.
#[derive(Clone)]
pub struct RecordingDelegate {
    runner: Arc<dyn CommandRunner>,
    prefetch: Decision,
    silent: Decision,
    prompt: Decision,
    calls: Arc<Mutex<Vec<DelegateCall>>>,
    runner_requests: Arc<AtomicUsize>,
    finished: Arc<watch::Sender<Vec<bool>>>,
}

impl std::fmt::Debug for RecordingDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingDelegate")
            .field("prefetch", &self.prefetch)
            .field("silent", &self.silent)
            .field("prompt", &self.prompt)
            .field("calls", &self.calls())
            .finish()
    }
}

impl RecordingDelegate {
    /// A delegate that accepts everything and installs with `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        let (finished, _) = watch::channel(Vec::new());
        Self {
            runner,
            prefetch: Decision::All,
            silent: Decision::All,
            prompt: Decision::All,
            calls: Arc::new(Mutex::new(Vec::new())),
            runner_requests: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(finished),
        }
    }

    pub fn with_prefetch(mut self, decision: Decision) -> Self {
        self.prefetch = decision;
        self
    }

    pub fn with_silent(mut self, decision: Decision) -> Self {
        self.silent = decision;
        self
    }

    pub fn with_prompt(mut self, decision: Decision) -> Self {
        self.prompt = decision;
        self
    }

    fn record(&self, call: DelegateCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    /// All calls so far.
    pub fn calls(&self) -> Vec<DelegateCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many times `command_runner` was requested.
    pub fn runner_requests(&self) -> usize {
        self.runner_requests.load(Ordering::SeqCst)
    }

    /// Results of the `keystone_finished` calls so far.
    pub fn finished_runs(&self) -> Vec<bool> {
        self.finished.borrow().clone()
    }

    /// Wait until `keystone_finished` has been called `n` times.
    pub async fn wait_for_finished_runs(&self, n: usize) -> Vec<bool> {
        let mut rx = self.finished.subscribe();
        let runs = match rx.wait_for(|runs| runs.len() >= n).await {
            Ok(runs) => runs.clone(),
            Err(_) => self.finished_runs(),
        };
        runs
    }
}

#[async_trait]
impl KeystoneDelegate for RecordingDelegate {
    fn keystone_started(&self) {
        self.record(DelegateCall::Started);
    }

    async fn should_prefetch_products(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        self.record(DelegateCall::ShouldPrefetch(ids(&products)));
        self.prefetch.apply(products)
    }

    async fn should_silently_update_products(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        self.record(DelegateCall::ShouldSilentlyUpdate(ids(&products)));
        self.silent.apply(products)
    }

    fn command_runner(&self) -> Arc<dyn CommandRunner> {
        self.runner_requests.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&self.runner)
    }

    async fn update_starting(&self, product: &UpdateInfo) {
        self.record(DelegateCall::UpdateStarting(product.product_id.clone()));
    }

    async fn update_finished(&self, product: &UpdateInfo, success: bool, wants_reboot: bool) {
        self.record(DelegateCall::UpdateFinished {
            product_id: product.product_id.clone(),
            success,
            wants_reboot,
        });
    }

    async fn should_update_products(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        self.record(DelegateCall::ShouldUpdate(ids(&products)));
        self.prompt.apply(products)
    }

    async fn keystone_finished(&self, success: bool) {
        self.record(DelegateCall::Finished(success));
        self.finished.send_modify(|runs| runs.push(success));
    }
}
