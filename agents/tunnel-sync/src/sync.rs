//! Reconciliation loop.
//!
//! One pass: fetch routers, skip if unchanged, extract hostnames, resolve
//! zones, then per account replace the tunnel ingress and reconcile every
//! hostname's DNS record. Passes run strictly one after another.

use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cloudflare::TunnelDnsProvider;
use crate::config::Config;
use crate::dns::{desired_record, DnsAction, DnsReconciler};
use crate::error::Result;
use crate::hostnames::{extract_hostnames, ExtractionPolicy};
use crate::ingress::{plan_ingress, same_ingress};
use crate::retry::RetryPolicy;
use crate::traefik::{Route, RouteSource};
use crate::zones::{filter_by_account, group_by_account, log_zones, AccountBatch, ZoneDirectory};

/// Settings the loop needs, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub tunnel_id: String,
    pub account_id: Option<String>,
    pub service_endpoint: String,
    pub local_address: String,
    pub extraction: ExtractionPolicy,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub retry: RetryPolicy,
    pub dry_run: bool,
}

impl From<&Config> for SyncSettings {
    fn from(config: &Config) -> Self {
        Self {
            tunnel_id: config.tunnel_id.clone(),
            account_id: config.account_id.clone(),
            service_endpoint: config.service_endpoint.clone(),
            local_address: config.local_address.clone(),
            extraction: ExtractionPolicy::new(config.entrypoints.clone(), config.skip_tls_routes),
            poll_interval: config.poll_interval,
            max_backoff: config.max_backoff,
            retry: RetryPolicy::default(),
            dry_run: config.dry_run,
        }
    }
}

/// Counters of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub accounts: usize,
    pub ingress_updated: usize,
    pub ingress_unchanged: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed_hosts: usize,
    pub failed_accounts: usize,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.failed_hosts == 0 && self.failed_accounts == 0
    }

    fn record(&mut self, action: &DnsAction) {
        match action {
            DnsAction::Create(_) => self.created += 1,
            DnsAction::Update { .. } => self.updated += 1,
            DnsAction::NoOp => self.unchanged += 1,
        }
    }
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Router fetch failed or returned nothing
    FetchFailed,
    /// Routers identical to the last committed pass
    Unchanged,
    /// No hostname in any eligible router
    NoHostnames,
    /// No zones visible, or no hostname matched a zone
    NoZoneMatches,
    Reconciled(PassReport),
}

/// Backoff after `failures` consecutive failed passes:
/// `min(max_backoff, poll_interval * 2^failures)`.
pub fn failure_backoff(poll_interval: Duration, failures: u32, max_backoff: Duration) -> Duration {
    let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
    poll_interval.saturating_mul(factor).min(max_backoff)
}

/// Poll interval plus a uniform jitter of up to half of it.
pub fn jittered_interval(poll_interval: Duration) -> Duration {
    let max_jitter = poll_interval.as_secs_f64() / 2.0;
    let jitter = if max_jitter > 0.0 {
        rand::thread_rng().gen_range(0.0..=max_jitter)
    } else {
        0.0
    };
    poll_interval + Duration::from_secs_f64(jitter)
}

/// Drives Traefik routers into Cloudflare tunnel ingress and DNS.
pub struct Syncer<R, P> {
    settings: SyncSettings,
    routes: R,
    provider: P,
    previous_routes: Option<Vec<Route>>,
    consecutive_failures: u32,
}

impl<R: RouteSource, P: TunnelDnsProvider> Syncer<R, P> {
    pub fn new(settings: SyncSettings, routes: R, provider: P) -> Self {
        Self {
            settings,
            routes,
            provider,
            previous_routes: None,
            consecutive_failures: 0,
        }
    }

    #[cfg(test)]
    fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    #[cfg(test)]
    fn provider(&self) -> &P {
        &self.provider
    }

    #[cfg(test)]
    fn route_source(&self) -> &R {
        &self.routes
    }

    /// Run passes until `shutdown` flips to true (or its sender is dropped).
    /// Errors never end the loop.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting sync loop...");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = tokio::select! {
                outcome = self.run_once() => outcome,
                _ = shutdown.changed() => {
                    info!("Shutdown requested, abandoning current pass");
                    break;
                }
            };

            let delay = self.next_delay(&outcome);
            debug!(delay_secs = delay.as_secs_f64(), "Sleeping until next pass");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Sync loop stopped");
    }

    /// Delay before the next pass, updating the failure counter.
    fn next_delay(&mut self, outcome: &Result<PassOutcome>) -> Duration {
        match outcome {
            Ok(PassOutcome::FetchFailed) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let wait = self.failure_wait();
                warn!(
                    failures = self.consecutive_failures,
                    "No routers found, waiting {}s before retry",
                    wait.as_secs()
                );
                wait
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let wait = self.failure_wait();
                error!(
                    error = %e,
                    failures = self.consecutive_failures,
                    "Error in sync loop, retrying in {}s",
                    wait.as_secs()
                );
                wait
            }
            Ok(_) => jittered_interval(self.settings.poll_interval),
        }
    }

    fn failure_wait(&self) -> Duration {
        failure_backoff(
            self.settings.poll_interval,
            self.consecutive_failures,
            self.settings.max_backoff,
        )
    }

    /// One reconciliation pass.
    ///
    /// Unexpected provider failures outside the per-account work (zone
    /// listing) are returned as errors; per-hostname and per-account failures
    /// are logged and counted in the report.
    pub async fn run_once(&mut self) -> Result<PassOutcome> {
        let routes = self.routes.fetch_routes().await;
        if routes.is_empty() {
            return Ok(PassOutcome::FetchFailed);
        }
        self.consecutive_failures = 0;

        if self.previous_routes.as_ref() == Some(&routes) {
            debug!("No changes in routers configuration");
            return Ok(PassOutcome::Unchanged);
        }
        info!(routers = routes.len(), "Changes detected in Traefik routers");

        let extracted = extract_hostnames(&routes, &self.settings.extraction);
        if extracted.is_empty() {
            warn!("No valid hostnames found in router rules");
            self.previous_routes = Some(routes);
            return Ok(PassOutcome::NoHostnames);
        }

        info!("Found {} unique hostnames:", extracted.len());
        for host in extracted.classified() {
            info!(hostname = %host.hostname, kind = %host.kind, "  - hostname");
        }

        info!("Fetching zones from Cloudflare API");
        let zones = filter_by_account(
            self.provider.list_zones().await?,
            self.settings.account_id.as_deref(),
        );
        if zones.is_empty() {
            warn!("No Cloudflare zones found for this API token");
            return Ok(PassOutcome::NoZoneMatches);
        }
        log_zones(&zones);

        let directory = ZoneDirectory::new(zones);
        let matches = directory.match_all(&extracted.classified());
        if matches.is_empty() {
            warn!("No hostnames matched with Cloudflare zones");
            self.previous_routes = Some(routes);
            return Ok(PassOutcome::NoZoneMatches);
        }

        let mut report = PassReport::default();
        for batch in group_by_account(matches) {
            report.accounts += 1;
            info!(account = %batch.account_name, account_id = %batch.account_id, "Processing account");

            if let Err(e) = self.sync_account(&batch, &mut report).await {
                report.failed_accounts += 1;
                error!(
                    account = %batch.account_name,
                    error = %e,
                    "Failed to configure tunnel for account"
                );
            }
        }

        info!(
            accounts = report.accounts,
            ingress_updated = report.ingress_updated,
            ingress_unchanged = report.ingress_unchanged,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            failed_hosts = report.failed_hosts,
            failed_accounts = report.failed_accounts,
            "Sync pass complete"
        );

        if report.is_clean() {
            self.previous_routes = Some(routes);
        } else {
            warn!("Pass finished with failures; it will be repeated on the next poll");
        }

        Ok(PassOutcome::Reconciled(report))
    }

    /// Replace the account's tunnel ingress, then reconcile each hostname's
    /// DNS record. A DNS failure only affects its own hostname.
    async fn sync_account(&self, batch: &AccountBatch, report: &mut PassReport) -> Result<()> {
        let settings = &self.settings;
        let tunnel_id = settings.tunnel_id.as_str();
        let ingress = plan_ingress(batch.matches.iter().map(|m| &m.host), &settings.service_endpoint);

        let current = self
            .provider
            .get_tunnel_config(&batch.account_id, tunnel_id)
            .await?;
        debug!(account = %batch.account_name, "Fetched current tunnel configuration");

        if same_ingress(current.ingress(), &ingress) {
            info!(account = %batch.account_name, "Tunnel configuration already up-to-date");
            report.ingress_unchanged += 1;
        } else if settings.dry_run {
            info!(
                account = %batch.account_name,
                rules = ingress.len(),
                "Would update tunnel configuration"
            );
            report.ingress_updated += 1;
        } else {
            settings
                .retry
                .run("update tunnel configuration", || {
                    self.provider
                        .update_tunnel_config(&batch.account_id, tunnel_id, &ingress)
                })
                .await?;
            info!(
                account = %batch.account_name,
                rules = ingress.len(),
                "Updated tunnel configuration"
            );
            report.ingress_updated += 1;
        }

        info!("Syncing DNS records...");
        let reconciler = DnsReconciler::new(&self.provider, settings.retry, settings.dry_run);
        for m in &batch.matches {
            let desired = desired_record(&m.host, tunnel_id, &settings.local_address);
            match reconciler.reconcile(&m.zone_id, &desired).await {
                Ok(action) => report.record(&action),
                Err(e) => {
                    report.failed_hosts += 1;
                    error!(hostname = %m.hostname(), error = %e, "Failed to manage DNS record");
                }
            }
        }

        Ok(())
    }
}
