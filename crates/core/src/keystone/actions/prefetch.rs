//! Prefetch stage.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::download::DownloadAction;
use crate::action::{Action, MultiPolicy, PipeContents, SubActionOutcome};
use crate::keystone::context::{KeystoneContext, UpdateServices};

/// Name of the prefetch stage on the engine's processor.
pub const PREFETCH_ACTION_NAME: &str = "prefetch";

/// Downloads the payloads the delegate wants ahead of time.
///
/// Always succeeds and passes its input through unchanged: a failed prefetch
/// only means the payload is fetched again at install time.
pub struct PrefetchPolicy {
    services: UpdateServices,
    ctx: KeystoneContext,
}

impl PrefetchPolicy {
    pub fn new(services: UpdateServices, ctx: KeystoneContext) -> Self {
        Self { services, ctx }
    }
}

#[async_trait]
impl MultiPolicy for PrefetchPolicy {
    async fn sub_actions(&mut self, input: Option<PipeContents>) -> Vec<Box<dyn Action>> {
        let available = input.and_then(PipeContents::into_updates).unwrap_or_default();
        if available.is_empty() {
            return Vec::new();
        }

        let chosen = self.ctx.should_prefetch(available).await;
        info!(count = chosen.len(), "Prefetching updates");
        chosen
            .into_iter()
            .map(|update| {
                Box::new(DownloadAction::new(
                    update,
                    Arc::clone(&self.services.fetchers),
                    self.services.download_dir.clone(),
                    self.ctx.clone(),
                )) as Box<dyn Action>
            })
            .collect()
    }

    fn aggregate(
        &mut self,
        input: Option<PipeContents>,
        _outcomes: &[SubActionOutcome],
    ) -> (bool, Option<PipeContents>) {
        (true, Some(input.unwrap_or(PipeContents::Updates(Vec::new()))))
    }
}
