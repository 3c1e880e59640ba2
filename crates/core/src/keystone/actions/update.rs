//! Silent and prompted update stages.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::download::DownloadAction;
use super::install::{InstallAction, RETURN_CODE_NOT_RUN};
use crate::action::{
    Action, ActionPipes, CompositeAction, Completion, MultiAction, MultiPolicy, Pipe, PipeContents,
    ProcessorHandle, SubActionOutcome,
};
use crate::command::CommandRunner;
use crate::keystone::context::{KeystoneContext, UpdateServices};
use crate::update::UpdateInfo;

/// Name of the silent update stage on the engine's processor.
pub const SILENT_UPDATE_ACTION_NAME: &str = "silent_update";

/// Name of the prompted update stage on the engine's processor.
pub const PROMPT_UPDATE_ACTION_NAME: &str = "prompt_update";

/// Installer return code carried by a pipe, or `-1` if there is none.
pub fn return_code_from(contents: Option<&PipeContents>) -> i32 {
    match contents {
        Some(PipeContents::ReturnCode(code)) => *code,
        _ => RETURN_CODE_NOT_RUN,
    }
}

/// Downloads then installs one product.
///
/// The installer's return code lands in [`result_pipe`](Self::result_pipe)
/// even when the install fails.
pub struct UpdateAction {
    update: UpdateInfo,
    result: Pipe,
    inner: CompositeAction,
}

impl UpdateAction {
    pub fn new(
        update: UpdateInfo,
        services: &UpdateServices,
        runner: Arc<dyn CommandRunner>,
        ctx: KeystoneContext,
        user_initiated: bool,
    ) -> Self {
        let download = DownloadAction::new(
            update.clone(),
            Arc::clone(&services.fetchers),
            services.download_dir.clone(),
            ctx.clone(),
        );
        let mut install = InstallAction::new(update.clone(), runner, user_initiated, ctx.span());
        let result = Pipe::new();
        install.set_out_pipe(result.clone());

        let inner = CompositeAction::new(
            format!("update:{}", update.product_id),
            vec![Box::new(download), Box::new(install)],
        )
        .with_span(ctx.span())
        .with_action_timeout(services.action_timeout);

        Self {
            update,
            result,
            inner,
        }
    }

    pub fn update_info(&self) -> &UpdateInfo {
        &self.update
    }

    pub fn result_pipe(&self) -> &Pipe {
        &self.result
    }

    pub fn return_code(&self) -> i32 {
        return_code_from(self.result.contents().as_ref())
    }

    pub fn wants_reboot(&self) -> bool {
        self.update.require_reboot && self.return_code() == 0
    }
}

impl Action for UpdateAction {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn pipes(&self) -> &ActionPipes {
        self.inner.pipes()
    }

    fn pipes_mut(&mut self) -> &mut ActionPipes {
        self.inner.pipes_mut()
    }

    fn perform(&mut self, completion: Completion) {
        self.inner.perform(completion);
    }

    fn terminate(&mut self) {
        self.inner.terminate();
    }
}

/// Which updates an [`UpdatePolicy`] installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Updates the delegate accepts without asking the user. Anything left
    /// over is handed to a prompted stage.
    Silent,
    /// Updates the delegate accepts after asking the user.
    Prompt,
}

/// Installs the updates the delegate picks, one [`UpdateAction`] each.
///
/// Always succeeds; the output is the number of updates attempted.
pub struct UpdatePolicy {
    mode: UpdateMode,
    services: UpdateServices,
    ctx: KeystoneContext,
    outer: Option<ProcessorHandle>,
    selected: Vec<(UpdateInfo, Pipe)>,
}

impl UpdatePolicy {
    /// Silent stage. Leftover updates are enqueued as a prompted stage on
    /// `outer`.
    pub fn silent(services: UpdateServices, ctx: KeystoneContext, outer: ProcessorHandle) -> Self {
        Self {
            mode: UpdateMode::Silent,
            services,
            ctx,
            outer: Some(outer),
            selected: Vec::new(),
        }
    }

    pub fn prompt(services: UpdateServices, ctx: KeystoneContext) -> Self {
        Self {
            mode: UpdateMode::Prompt,
            services,
            ctx,
            outer: None,
            selected: Vec::new(),
        }
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    async fn choose_silent(&self, available: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        let candidates: Vec<UpdateInfo> = available
            .iter()
            .filter(|update| !update.prompt_user)
            .cloned()
            .collect();
        let chosen = if candidates.is_empty() {
            Vec::new()
        } else {
            self.ctx.should_silently_update(candidates).await
        };

        let remainder: Vec<UpdateInfo> = available
            .into_iter()
            .filter(|update| !chosen.iter().any(|c| c.is_for_product(&update.product_id)))
            .collect();
        if !remainder.is_empty() {
            self.enqueue_prompt(remainder);
        }
        chosen
    }

    fn enqueue_prompt(&self, remainder: Vec<UpdateInfo>) {
        let Some(outer) = &self.outer else {
            return;
        };
        let count = remainder.len();
        let mut prompt = MultiAction::new(
            PROMPT_UPDATE_ACTION_NAME,
            UpdatePolicy::prompt(self.services.clone(), self.ctx.clone()),
        )
        .with_span(self.ctx.span());
        prompt.set_in_pipe(Pipe::with_contents(PipeContents::Updates(remainder)));

        match outer.enqueue(Box::new(prompt)) {
            Some(id) => info!(action = %id, count, "Queued updates that need the user"),
            None => warn!(count, "Processor is gone, dropping updates that need the user"),
        }
    }

    async fn choose_prompted(&self, available: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        let stats = self.ctx.stats();
        if let Some(stats) = &stats {
            stats.inc_prompts();
        }
        let chosen = self.ctx.should_update(available).await;
        if let Some(stats) = &stats {
            stats.add_prompt_updates(chosen.len());
        }
        chosen
    }
}

#[async_trait]
impl MultiPolicy for UpdatePolicy {
    async fn sub_actions(&mut self, input: Option<PipeContents>) -> Vec<Box<dyn Action>> {
        let available = input.and_then(PipeContents::into_updates).unwrap_or_default();
        if available.is_empty() {
            return Vec::new();
        }

        let chosen = match self.mode {
            UpdateMode::Silent => self.choose_silent(available).await,
            UpdateMode::Prompt => self.choose_prompted(available).await,
        };
        info!(mode = ?self.mode, count = chosen.len(), "Installing updates");

        let mut actions: Vec<Box<dyn Action>> = Vec::with_capacity(chosen.len());
        for update in chosen {
            let Some(runner) = self.ctx.command_runner() else {
                warn!(product_id = %update.product_id, "No command runner available, skipping update");
                continue;
            };
            let action = UpdateAction::new(
                update.clone(),
                &self.services,
                runner,
                self.ctx.clone(),
                self.mode == UpdateMode::Prompt,
            );
            self.selected.push((update, action.result_pipe().clone()));
            actions.push(Box::new(action));
        }
        actions
    }

    async fn sub_action_starting(&mut self, index: usize) {
        if let Some((update, _)) = self.selected.get(index) {
            self.ctx.update_starting(update).await;
        }
    }

    async fn sub_action_finished(&mut self, index: usize, outcome: &SubActionOutcome) {
        let Some((update, result)) = self.selected.get(index) else {
            return;
        };
        let code = return_code_from(result.contents().as_ref());
        if let Some(stats) = self.ctx.stats() {
            stats.set_install_rc(&update.product_id, code);
        }
        let wants_reboot = outcome.success && update.require_reboot;
        info!(
            product_id = %update.product_id,
            success = outcome.success,
            return_code = code,
            wants_reboot,
            "Update finished"
        );
        self.ctx.update_finished(update, outcome.success, wants_reboot).await;
    }

    fn aggregate(
        &mut self,
        _input: Option<PipeContents>,
        outcomes: &[SubActionOutcome],
    ) -> (bool, Option<PipeContents>) {
        (true, Some(PipeContents::Count(outcomes.len())))
    }
}
