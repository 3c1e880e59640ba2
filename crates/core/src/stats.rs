//! Prometheus statistics for update runs.
//!
//! Collection is opt-in: a [`KeystoneStats`] is handed to the engine with
//! `Keystone::set_stats` and every counter lives in the instance's own
//! registry, so independent engines never share numbers.

use prometheus::{Encoder, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tickets: u64,
    pub valid_tickets: u64,
    pub checks: u64,
    pub failed_checks: u64,
    pub prompts: u64,
    pub prompt_updates: u64,
    pub downloads: u64,
    pub download_cache_hits: u64,
    pub failed_downloads: u64,
}

/// Counters collected while the engine runs.
pub struct KeystoneStats {
    registry: Registry,
    tickets: IntCounter,
    valid_tickets: IntCounter,
    checks: IntCounter,
    failed_checks: IntCounter,
    prompts: IntCounter,
    prompt_updates: IntCounter,
    downloads: IntCounter,
    download_cache_hits: IntCounter,
    failed_downloads: IntCounter,
    install_rc: IntGaugeVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace("keystone"))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl KeystoneStats {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let install_rc = IntGaugeVec::new(
            Opts::new("install_rc", "Return code of the last install, per product")
                .namespace("keystone"),
            &["product"],
        )?;
        registry.register(Box::new(install_rc.clone()))?;

        Ok(Self {
            tickets: counter(&registry, "tickets_total", "Tickets read from the store")?,
            valid_tickets: counter(
                &registry,
                "valid_tickets_total",
                "Tickets whose product is installed",
            )?,
            checks: counter(&registry, "checks_total", "Update checks sent to servers")?,
            failed_checks: counter(&registry, "failed_checks_total", "Update checks that failed")?,
            prompts: counter(&registry, "prompts_total", "Times the user was asked to update")?,
            prompt_updates: counter(
                &registry,
                "prompt_updates_total",
                "Updates approved after a prompt",
            )?,
            downloads: counter(&registry, "downloads_total", "Payloads downloaded")?,
            download_cache_hits: counter(
                &registry,
                "download_cache_hits_total",
                "Payloads reused from the download directory",
            )?,
            failed_downloads: counter(&registry, "failed_downloads_total", "Payload downloads that failed")?,
            install_rc,
            registry,
        })
    }

    pub fn add_tickets(&self, n: usize) {
        self.tickets.inc_by(n as u64);
    }

    pub fn add_valid_tickets(&self, n: usize) {
        self.valid_tickets.inc_by(n as u64);
    }

    pub fn inc_checks(&self) {
        self.checks.inc();
    }

    pub fn inc_failed_checks(&self) {
        self.failed_checks.inc();
    }

    pub fn inc_prompts(&self) {
        self.prompts.inc();
    }

    pub fn add_prompt_updates(&self, n: usize) {
        self.prompt_updates.inc_by(n as u64);
    }

    pub fn inc_downloads(&self) {
        self.downloads.inc();
    }

    pub fn inc_download_cache_hits(&self) {
        self.download_cache_hits.inc();
    }

    pub fn inc_failed_downloads(&self) {
        self.failed_downloads.inc();
    }

    pub fn set_install_rc(&self, product_id: &str, code: i32) {
        self.install_rc
            .with_label_values(&[product_id])
            .set(i64::from(code));
    }

    /// Last recorded install return code for a product.
    pub fn install_rc(&self, product_id: &str) -> Option<i64> {
        // Looking up a label set creates it, so check first.
        if !self.has_install_rc(product_id) {
            return None;
        }
        self.install_rc
            .get_metric_with_label_values(&[product_id])
            .ok()
            .map(|gauge| gauge.get())
    }

    fn has_install_rc(&self, product_id: &str) -> bool {
        self.registry.gather().iter().any(|family| {
            family.get_name() == "keystone_install_rc"
                && family.get_metric().iter().any(|metric| {
                    metric
                        .get_label()
                        .iter()
                        .any(|label| label.get_name() == "product" && label.get_value() == product_id)
                })
        })
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tickets: self.tickets.get(),
            valid_tickets: self.valid_tickets.get(),
            checks: self.checks.get(),
            failed_checks: self.failed_checks.get(),
            prompts: self.prompts.get(),
            prompt_updates: self.prompt_updates.get(),
            downloads: self.downloads.get(),
            download_cache_hits: self.download_cache_hits.get(),
            failed_downloads: self.failed_downloads.get(),
        }
    }

    /// Render all statistics in the Prometheus text format.
    pub fn encode_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode statistics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl std::fmt::Debug for KeystoneStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoneStats")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
