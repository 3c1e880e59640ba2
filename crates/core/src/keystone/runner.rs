//! Update engine.
//!
//! One run is three stages on a single processor:
//! - **check**: one request per update server, any answer is enough
//! - **prefetch**: download what the delegate wants ahead of time
//! - **silent_update**: install without asking, then hand the rest to a
//!   prompted stage

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, Instrument, Span};
use uuid::Uuid;

use super::actions::{
    CheckPolicy, PrefetchPolicy, UpdatePolicy, CHECK_ACTION_NAME, PREFETCH_ACTION_NAME,
    SILENT_UPDATE_ACTION_NAME,
};
use super::config::KeystoneConfig;
use super::context::{KeystoneContext, KeystoneShared, UpdateServices};
use super::delegate::KeystoneDelegate;
use super::types::{KeystoneError, KeystoneParams, KeystoneStatus};
use crate::action::{bond, ActionProcessor, MultiAction, ProcessorConfig, ProcessorEvent};
use crate::fetch::FetcherFactory;
use crate::server::ServerFactory;
use crate::stats::KeystoneStats;
use crate::ticket::{Ticket, TicketStore};

/// Checks for and installs updates for the products in a ticket store.
///
/// Only one run may be active at a time. Must be created inside a Tokio
/// runtime.
pub struct Keystone {
    config: KeystoneConfig,
    ticket_store: Arc<dyn TicketStore>,
    services: UpdateServices,
    shared: Arc<KeystoneShared>,
    processor: ActionProcessor,
    run_lock: Mutex<()>,
    listener: JoinHandle<()>,
}

impl Keystone {
    pub fn new(
        config: KeystoneConfig,
        ticket_store: Arc<dyn TicketStore>,
        delegate: Arc<dyn KeystoneDelegate>,
        fetchers: Arc<dyn FetcherFactory>,
        servers: Arc<dyn ServerFactory>,
    ) -> Self {
        let (processor, events) = ActionProcessor::with_events(ProcessorConfig::default());
        let shared = Arc::new(KeystoneShared::new(delegate));
        let listener = tokio::spawn(report_runs(Arc::downgrade(&shared), events));
        let services = UpdateServices {
            fetchers,
            servers,
            download_dir: config.download_dir.clone(),
            action_timeout: config.action_timeout,
        };

        Self {
            config,
            ticket_store,
            services,
            shared,
            processor,
            run_lock: Mutex::new(()),
            listener,
        }
    }

    pub fn config(&self) -> &KeystoneConfig {
        &self.config
    }

    pub fn ticket_store(&self) -> &Arc<dyn TicketStore> {
        &self.ticket_store
    }

    pub fn delegate(&self) -> Arc<dyn KeystoneDelegate> {
        self.shared.delegate()
    }

    pub fn set_delegate(&self, delegate: Arc<dyn KeystoneDelegate>) {
        *self
            .shared
            .delegate
            .write()
            .unwrap_or_else(PoisonError::into_inner) = delegate;
    }

    pub fn params(&self) -> KeystoneParams {
        self.shared.params()
    }

    /// Parameters sent to update servers from the next check on.
    pub fn set_params(&self, params: KeystoneParams) {
        *self
            .shared
            .params
            .write()
            .unwrap_or_else(PoisonError::into_inner) = params;
    }

    pub fn stats(&self) -> Option<Arc<KeystoneStats>> {
        self.shared.stats()
    }

    /// Start or stop collecting statistics.
    pub fn set_stats(&self, stats: Option<Arc<KeystoneStats>>) {
        *self
            .shared
            .stats
            .write()
            .unwrap_or_else(PoisonError::into_inner) = stats;
    }

    pub fn is_updating(&self) -> bool {
        self.processor.is_processing()
    }

    pub fn status(&self) -> KeystoneStatus {
        KeystoneStatus {
            updating: self.is_updating(),
            current_action: self.processor.current_action(),
            queued_actions: self.processor.queued_count(),
            actions_completed: self.processor.actions_completed(),
        }
    }

    /// Check and update every installed product in the ticket store.
    pub fn update_all_products(&self) -> Result<(), KeystoneError> {
        let _guard = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_updating() {
            return Err(KeystoneError::AlreadyUpdating);
        }

        let tickets = self.ticket_store.tickets()?;
        if let Some(stats) = self.stats() {
            stats.add_tickets(tickets.len());
        }
        debug!(total = tickets.len(), "Selected tickets for update");

        self.begin_run(tickets);
        Ok(())
    }

    /// Check and update a single product.
    pub fn update_product_with_product_id(&self, product_id: &str) -> Result<(), KeystoneError> {
        let _guard = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_updating() {
            return Err(KeystoneError::AlreadyUpdating);
        }

        let ticket = self
            .ticket_store
            .ticket_for_product_id(product_id)?
            .ok_or_else(|| KeystoneError::UnknownProduct(product_id.to_string()))?;
        if let Some(stats) = self.stats() {
            stats.add_tickets(1);
        }

        self.begin_run(vec![ticket]);
        Ok(())
    }

    /// Stop the current run and discard everything queued. The delegate is
    /// not told the run finished.
    pub fn stop_and_reset(&self) {
        if self.is_updating() {
            info!("Stopping update run");
        }
        self.processor.stop();
    }

    /// Resolve once no run is active.
    pub async fn wait_until_idle(&self) {
        self.processor.wait_until_idle().await;
    }

    fn begin_run(&self, tickets: Vec<Ticket>) {
        let span = info_span!(parent: None, "keystone_run", session = %Uuid::new_v4());
        *self
            .shared
            .run_span
            .write()
            .unwrap_or_else(PoisonError::into_inner) = span.clone();
        let ctx = KeystoneContext::new(&self.shared, span.clone());

        let _entered = span.enter();
        info!(tickets = tickets.len(), "Starting update run");
        self.delegate().keystone_started();

        let mut check = MultiAction::new(
            CHECK_ACTION_NAME,
            CheckPolicy::new(tickets, self.services.clone(), ctx.clone()),
        )
        .with_span(span.clone())
        .with_action_timeout(self.services.action_timeout);
        let mut prefetch = MultiAction::new(
            PREFETCH_ACTION_NAME,
            PrefetchPolicy::new(self.services.clone(), ctx.clone()),
        )
        .with_span(span.clone())
        .with_action_timeout(self.services.action_timeout);
        let mut silent = MultiAction::new(
            SILENT_UPDATE_ACTION_NAME,
            UpdatePolicy::silent(self.services.clone(), ctx, self.processor.handle()),
        )
        .with_span(span.clone());
        bond(&mut check, &mut prefetch);
        bond(&mut prefetch, &mut silent);

        self.processor.enqueue(Box::new(check));
        self.processor.enqueue(Box::new(prefetch));
        self.processor.enqueue(Box::new(silent));
        self.processor.start();
    }
}

impl Drop for Keystone {
    fn drop(&mut self) {
        self.processor.stop();
        self.listener.abort();
    }
}

impl std::fmt::Debug for Keystone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystone")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

/// Turn processor events into `keystone_finished` calls.
async fn report_runs(
    shared: Weak<KeystoneShared>,
    mut events: mpsc::UnboundedReceiver<ProcessorEvent>,
) {
    let mut check_succeeded = false;
    while let Some(event) = events.recv().await {
        match event {
            ProcessorEvent::Started => check_succeeded = false,
            ProcessorEvent::Finished { name, success, .. } if name == CHECK_ACTION_NAME => {
                check_succeeded = success;
            }
            ProcessorEvent::Done => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let delegate = shared.delegate();
                let span: Span = shared.run_span();
                async {
                    info!(success = check_succeeded, "Update run finished");
                    delegate.keystone_finished(check_succeeded).await;
                }
                .instrument(span)
                .await;
            }
            ProcessorEvent::Stopped => {
                check_succeeded = false;
                debug!("Update run stopped");
            }
            _ => {}
        }
    }
}
