//! State shared between the engine and the actions it builds.

use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tracing::Span;

use super::{KeystoneDelegate, KeystoneParams};
use crate::command::CommandRunner;
use crate::fetch::FetcherFactory;
use crate::server::ServerFactory;
use crate::stats::KeystoneStats;
use crate::update::UpdateInfo;

/// Collaborators the update actions talk to.
#[derive(Clone)]
pub struct UpdateServices {
    pub fetchers: Arc<dyn FetcherFactory>,
    pub servers: Arc<dyn ServerFactory>,
    pub download_dir: PathBuf,
    /// Deadline for each check, download and install.
    pub action_timeout: Option<Duration>,
}

/// Mutable engine state reachable from actions.
pub(crate) struct KeystoneShared {
    pub(crate) delegate: RwLock<Arc<dyn KeystoneDelegate>>,
    pub(crate) params: RwLock<KeystoneParams>,
    pub(crate) stats: RwLock<Option<Arc<KeystoneStats>>>,
    pub(crate) run_span: RwLock<Span>,
}

impl KeystoneShared {
    pub(crate) fn new(delegate: Arc<dyn KeystoneDelegate>) -> Self {
        Self {
            delegate: RwLock::new(delegate),
            params: RwLock::new(KeystoneParams::default()),
            stats: RwLock::new(None),
            run_span: RwLock::new(Span::none()),
        }
    }

    pub(crate) fn delegate(&self) -> Arc<dyn KeystoneDelegate> {
        Arc::clone(&self.delegate.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub(crate) fn params(&self) -> KeystoneParams {
        self.params.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn stats(&self) -> Option<Arc<KeystoneStats>> {
        self.stats.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn run_span(&self) -> Span {
        self.run_span.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Non-owning handle from an action back to its engine.
///
/// Once the engine is dropped every hook falls back to its default: filters
/// pass everything through, notifications are skipped and no command runner
/// is available.
#[derive(Clone)]
pub struct KeystoneContext {
    shared: Weak<KeystoneShared>,
    span: Span,
}

impl KeystoneContext {
    pub(crate) fn new(shared: &Arc<KeystoneShared>, span: Span) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            span,
        }
    }

    /// A context not attached to any engine.
    pub fn detached() -> Self {
        Self {
            shared: Weak::new(),
            span: Span::none(),
        }
    }

    /// Tracing span of the run this context belongs to.
    pub fn span(&self) -> Span {
        self.span.clone()
    }

    pub fn delegate(&self) -> Option<Arc<dyn KeystoneDelegate>> {
        self.shared.upgrade().map(|shared| shared.delegate())
    }

    pub fn stats(&self) -> Option<Arc<KeystoneStats>> {
        self.shared.upgrade().and_then(|shared| shared.stats())
    }

    pub fn params(&self) -> KeystoneParams {
        self.shared
            .upgrade()
            .map(|shared| shared.params())
            .unwrap_or_default()
    }

    pub fn command_runner(&self) -> Option<Arc<dyn CommandRunner>> {
        self.delegate().map(|delegate| delegate.command_runner())
    }

    pub async fn should_prefetch(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        match self.delegate() {
            Some(delegate) => {
                let chosen = delegate.should_prefetch_products(products.clone()).await;
                retain_offered(&products, chosen)
            }
            None => products,
        }
    }

    pub async fn should_silently_update(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        match self.delegate() {
            Some(delegate) => {
                let chosen = delegate
                    .should_silently_update_products(products.clone())
                    .await;
                retain_offered(&products, chosen)
            }
            None => products,
        }
    }

    pub async fn should_update(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        match self.delegate() {
            Some(delegate) => {
                let chosen = delegate.should_update_products(products.clone()).await;
                retain_offered(&products, chosen)
            }
            None => products,
        }
    }

    pub async fn update_starting(&self, product: &UpdateInfo) {
        if let Some(delegate) = self.delegate() {
            delegate.update_starting(product).await;
        }
    }

    pub async fn update_finished(&self, product: &UpdateInfo, success: bool, wants_reboot: bool) {
        if let Some(delegate) = self.delegate() {
            delegate.update_finished(product, success, wants_reboot).await;
        }
    }
}

/// Keep the entries of `chosen` that were actually offered, using the offered
/// copy and the order of `chosen`. Duplicates are dropped.
pub fn retain_offered(offered: &[UpdateInfo], chosen: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
    let mut kept: Vec<UpdateInfo> = Vec::with_capacity(chosen.len());
    for choice in chosen {
        if kept.iter().any(|k| k.is_for_product(&choice.product_id)) {
            continue;
        }
        match offered.iter().find(|o| o.is_for_product(&choice.product_id)) {
            Some(original) => kept.push(original.clone()),
            None => tracing::warn!(
                product_id = %choice.product_id,
                "Delegate chose a product that was not offered, ignoring"
            ),
        }
    }
    kept
}
