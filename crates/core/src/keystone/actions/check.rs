//! Update check stage.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::action::{
    Action, ActionPipes, ActionTask, Completion, MultiPolicy, PipeContents, SubActionOutcome,
};
use crate::fetch::{fetch_with, FetcherFactory};
use crate::keystone::context::{KeystoneContext, UpdateServices};
use crate::keystone::types::ActionError;
use crate::server::UpdateServer;
use crate::ticket::{tickets_by_server_url, Ticket};
use crate::update::UpdateInfo;

/// Name of the check stage on the engine's processor.
pub const CHECK_ACTION_NAME: &str = "check";

/// Asks one update server about a group of tickets.
///
/// Outputs `Updates` on success. Updates for products that were not asked
/// about are dropped.
pub struct UpdateCheckAction {
    name: String,
    pipes: ActionPipes,
    server: Arc<dyn UpdateServer>,
    tickets: Vec<Ticket>,
    fetchers: Arc<dyn FetcherFactory>,
    ctx: KeystoneContext,
    task: ActionTask,
}

impl UpdateCheckAction {
    pub fn new(
        server: Box<dyn UpdateServer>,
        tickets: Vec<Ticket>,
        fetchers: Arc<dyn FetcherFactory>,
        ctx: KeystoneContext,
    ) -> Self {
        Self {
            name: format!("check:{}", server.url()),
            pipes: ActionPipes::default(),
            server: Arc::from(server),
            tickets,
            fetchers,
            ctx,
            task: ActionTask::new(),
        }
    }
}

async fn check_server(
    server: &dyn UpdateServer,
    tickets: &[Ticket],
    fetchers: &dyn FetcherFactory,
) -> Result<Vec<UpdateInfo>, ActionError> {
    let mut updates = Vec::new();
    for request in server.requests_for_tickets(tickets)? {
        let response = fetch_with(fetchers, request).await?;
        debug!(
            server = server.url(),
            response = %server.pretty_print_response(&response),
            "Update check response"
        );
        for update in server.update_infos_for_response(&response)? {
            if tickets.iter().any(|t| update.is_for_product(t.product_id())) {
                updates.push(update);
            } else {
                warn!(
                    server = server.url(),
                    product_id = %update.product_id,
                    "Server offered an update for a product we did not ask about"
                );
            }
        }
    }
    Ok(updates)
}

impl Action for UpdateCheckAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn pipes(&self) -> &ActionPipes {
        &self.pipes
    }

    fn pipes_mut(&mut self) -> &mut ActionPipes {
        &mut self.pipes
    }

    fn perform(&mut self, completion: Completion) {
        let server = Arc::clone(&self.server);
        let tickets = std::mem::take(&mut self.tickets);
        let fetchers = Arc::clone(&self.fetchers);
        let output = self.pipes.output.clone();

        self.task.spawn(completion, self.ctx.span(), async move {
            match check_server(server.as_ref(), &tickets, fetchers.as_ref()).await {
                Ok(updates) => {
                    debug!(server = server.url(), updates = updates.len(), "Update check succeeded");
                    if let Some(output) = output {
                        output.set_contents(PipeContents::Updates(updates));
                    }
                    true
                }
                Err(e) => {
                    warn!(server = server.url(), error = %e, "Update check failed");
                    false
                }
            }
        });
    }

    fn terminate(&mut self) {
        self.task.abort();
    }
}

/// Check stage: one [`UpdateCheckAction`] per distinct server.
///
/// Tickets whose product is no longer installed are skipped. Succeeds if at
/// least one server answered. The output is every update from
/// the servers that answered.
pub struct CheckPolicy {
    tickets: Vec<Ticket>,
    services: UpdateServices,
    ctx: KeystoneContext,
}

impl CheckPolicy {
    pub fn new(tickets: Vec<Ticket>, services: UpdateServices, ctx: KeystoneContext) -> Self {
        Self {
            tickets,
            services,
            ctx,
        }
    }
}

#[async_trait]
impl MultiPolicy for CheckPolicy {
    async fn sub_actions(&mut self, _input: Option<PipeContents>) -> Vec<Box<dyn Action>> {
        let params = self.ctx.params();
        let stats = self.ctx.stats();

        let mut installed = Vec::with_capacity(self.tickets.len());
        for ticket in std::mem::take(&mut self.tickets) {
            if ticket.is_installed().await {
                installed.push(ticket);
            } else {
                debug!(product_id = ticket.product_id(), "Product is not installed, skipping");
            }
        }
        if let Some(stats) = &stats {
            stats.add_valid_tickets(installed.len());
        }

        let grouped = tickets_by_server_url(&installed);
        info!(tickets = installed.len(), servers = grouped.len(), "Checking for updates");

        grouped
            .into_iter()
            .map(|(url, tickets)| {
                if let Some(stats) = &stats {
                    stats.inc_checks();
                }
                let server = self.services.servers.create_server(&url, &params);
                Box::new(UpdateCheckAction::new(
                    server,
                    tickets,
                    Arc::clone(&self.services.fetchers),
                    self.ctx.clone(),
                )) as Box<dyn Action>
            })
            .collect()
    }

    async fn sub_action_finished(&mut self, _index: usize, outcome: &SubActionOutcome) {
        if !outcome.success {
            if let Some(stats) = self.ctx.stats() {
                stats.inc_failed_checks();
            }
        }
    }

    fn aggregate(
        &mut self,
        _input: Option<PipeContents>,
        outcomes: &[SubActionOutcome],
    ) -> (bool, Option<PipeContents>) {
        let success = outcomes.is_empty() || outcomes.iter().any(|o| o.success);
        let updates: Vec<UpdateInfo> = outcomes
            .iter()
            .filter(|o| o.success)
            .filter_map(|o| o.output.clone().and_then(PipeContents::into_updates))
            .flatten()
            .collect();

        if success {
            info!(available = updates.len(), "Update check finished");
        } else {
            warn!(servers = outcomes.len(), "No update server could be reached");
        }
        (success, Some(PipeContents::Updates(updates)))
    }
}
