//! Decision hooks supplied by the embedding application.

use std::sync::Arc;

use async_trait::async_trait;

use crate::command::CommandRunner;
use crate::update::UpdateInfo;

/// Receives progress from a [`Keystone`](super::Keystone) and decides which
/// updates to apply.
///
/// Only [`command_runner`](KeystoneDelegate::command_runner) must be
/// implemented. The filtering hooks default to accepting everything they are
/// offered; products returned that were not offered are ignored.
#[async_trait]
pub trait KeystoneDelegate: Send + Sync {
    /// A run is starting.
    fn keystone_started(&self) {}

    /// Choose which available updates to download ahead of time.
    async fn should_prefetch_products(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        products
    }

    /// Choose which updates to install without asking the user. Products
    /// flagged `prompt_user` are never offered here.
    async fn should_silently_update_products(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        products
    }

    /// Runner used for installer commands. Requested once per update.
    fn command_runner(&self) -> Arc<dyn CommandRunner>;

    async fn update_starting(&self, _product: &UpdateInfo) {}

    async fn update_finished(&self, _product: &UpdateInfo, _success: bool, _wants_reboot: bool) {}

    /// Choose which of the remaining updates to install, typically after
    /// asking the user.
    async fn should_update_products(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        products
    }

    /// The run is over. `success` is false when no update server could be
    /// reached, i.e. it is unknown whether updates are available.
    async fn keystone_finished(&self, _success: bool) {}
}
