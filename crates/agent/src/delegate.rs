//! Delegate used by the command line agent.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use keystone_core::{CommandRunner, KeystoneDelegate, UpdateInfo};

/// Whether the agent only lists updates or installs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    List,
    Install,
}

/// Outcome of one install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallResult {
    pub product_id: String,
    pub display_version: Option<String>,
    pub success: bool,
    pub wants_reboot: bool,
}

/// Everything the agent learned during one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Whether an update server could be reached. `None` until the run ends.
    pub success: Option<bool>,
    pub available: Vec<UpdateInfo>,
    pub installed: Vec<InstallResult>,
}

impl RunReport {
    pub fn failed_installs(&self) -> usize {
        self.installed.iter().filter(|r| !r.success).count()
    }

    pub fn wants_reboot(&self) -> bool {
        self.installed.iter().any(|r| r.wants_reboot)
    }

    fn record_available(&mut self, products: &[UpdateInfo]) {
        for product in products {
            if !self
                .available
                .iter()
                .any(|known| known.is_for_product(&product.product_id))
            {
                self.available.push(product.clone());
            }
        }
    }
}

/// Lists or installs every update offered, and collects a [`RunReport`].
pub struct AgentDelegate {
    mode: AgentMode,
    runner: Arc<dyn CommandRunner>,
    report: Mutex<RunReport>,
    finished: watch::Sender<bool>,
}

impl AgentDelegate {
    pub fn new(mode: AgentMode, runner: Arc<dyn CommandRunner>) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            mode,
            runner,
            report: Mutex::new(RunReport::default()),
            finished,
        }
    }

    fn with_report<R>(&self, f: impl FnOnce(&mut RunReport) -> R) -> R {
        let mut report = self.report.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut report)
    }

    fn accept(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        self.with_report(|report| report.record_available(&products));
        match self.mode {
            AgentMode::List => Vec::new(),
            AgentMode::Install => products,
        }
    }

    pub fn report(&self) -> RunReport {
        self.with_report(|report| report.clone())
    }

    /// Wait for the run to end and return its report.
    pub async fn wait_for_report(&self) -> RunReport {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|finished| *finished).await;
        self.report()
    }
}

#[async_trait]
impl KeystoneDelegate for AgentDelegate {
    fn keystone_started(&self) {
        self.finished.send_replace(false);
        self.with_report(|report| *report = RunReport::default());
    }

    async fn should_prefetch_products(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        match self.mode {
            AgentMode::List => Vec::new(),
            AgentMode::Install => products,
        }
    }

    async fn should_silently_update_products(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        self.accept(products)
    }

    fn command_runner(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    async fn update_starting(&self, product: &UpdateInfo) {
        info!(product = %product.display_name(), "Installing");
    }

    async fn update_finished(&self, product: &UpdateInfo, success: bool, wants_reboot: bool) {
        self.with_report(|report| {
            report.installed.push(InstallResult {
                product_id: product.product_id.clone(),
                display_version: product.display_version.clone(),
                success,
                wants_reboot,
            })
        });
    }

    async fn should_update_products(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        self.accept(products)
    }

    async fn keystone_finished(&self, success: bool) {
        self.with_report(|report| report.success = Some(success));
        self.finished.send_replace(true);
    }
}
