//! DNS record reconciliation.
//!
//! Public hostnames point at the tunnel through a proxied CNAME; local
//! hostnames get an unproxied A record to the backend's address. Only the
//! record type the hostname should have is ever inspected or written.

use serde::Serialize;
use tracing::{debug, info};

use crate::cloudflare::{
    DnsRecord, DnsRecordRequest, DnsRecordType, TunnelDnsProvider, AUTO_TTL, RECORD_COMMENT,
};
use crate::error::Result;
use crate::hostnames::{ClassifiedHost, HostKind};
use crate::retry::RetryPolicy;

/// Record the hostname should have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesiredRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: DnsRecordType,
    pub content: String,
    pub proxied: bool,
    pub ttl: u32,
}

impl DesiredRecord {
    pub fn to_request(&self) -> DnsRecordRequest {
        DnsRecordRequest {
            record_type: self.record_type,
            name: self.name.clone(),
            content: self.content.clone(),
            ttl: self.ttl,
            proxied: self.proxied,
            comment: Some(RECORD_COMMENT.to_string()),
        }
    }

    /// Whether `record` already carries this content and proxy flag.
    pub fn is_satisfied_by(&self, record: &DnsRecord) -> bool {
        record.content == self.content && record.proxied == Some(self.proxied)
    }
}

/// CNAME target of a tunnel.
pub fn tunnel_target(tunnel_id: &str) -> String {
    format!("{}.cfargotunnel.com", tunnel_id)
}

pub fn desired_record(host: &ClassifiedHost, tunnel_id: &str, local_address: &str) -> DesiredRecord {
    match host.kind {
        HostKind::Local => DesiredRecord {
            name: host.hostname.clone(),
            record_type: DnsRecordType::A,
            content: local_address.to_string(),
            proxied: false,
            ttl: AUTO_TTL,
        },
        HostKind::Public => DesiredRecord {
            name: host.hostname.clone(),
            record_type: DnsRecordType::CNAME,
            content: tunnel_target(tunnel_id),
            proxied: true,
            ttl: AUTO_TTL,
        },
    }
}

/// Decision for one hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsAction {
    Create(DesiredRecord),
    Update {
        record_id: String,
        desired: DesiredRecord,
    },
    NoOp,
}

/// Compare the desired record against the existing ones of the same
/// name and type. When the provider returns several, the first is used.
pub fn plan_dns_action(desired: &DesiredRecord, existing: &[DnsRecord]) -> DnsAction {
    match existing.first() {
        None => DnsAction::Create(desired.clone()),
        Some(record) if desired.is_satisfied_by(record) => DnsAction::NoOp,
        Some(record) => DnsAction::Update {
            record_id: record.id.clone(),
            desired: desired.clone(),
        },
    }
}

/// Applies DNS decisions through a provider.
pub struct DnsReconciler<'a, P: ?Sized> {
    provider: &'a P,
    retry: RetryPolicy,
    dry_run: bool,
}

impl<'a, P: TunnelDnsProvider + ?Sized> DnsReconciler<'a, P> {
    pub fn new(provider: &'a P, retry: RetryPolicy, dry_run: bool) -> Self {
        Self {
            provider,
            retry,
            dry_run,
        }
    }

    /// Bring the record for `desired.name` in `zone_id` to the desired state.
    /// Writes are retried; the decision taken is returned.
    pub async fn reconcile(&self, zone_id: &str, desired: &DesiredRecord) -> Result<DnsAction> {
        let existing = self
            .provider
            .list_dns_records(zone_id, &desired.name, desired.record_type)
            .await?;
        if existing.len() > 1 {
            debug!(
                hostname = %desired.name,
                count = existing.len(),
                "Multiple {} records found, using the first", desired.record_type
            );
        }

        let action = plan_dns_action(desired, &existing);
        match &action {
            DnsAction::NoOp => {
                info!(hostname = %desired.name, "[DNS] {} record already up-to-date", desired.record_type);
            }
            DnsAction::Create(record) if self.dry_run => {
                info!(hostname = %record.name, "[DNS] Would create {} -> {} (proxied={})", record.record_type, record.content, record.proxied);
            }
            DnsAction::Update { desired: record, .. } if self.dry_run => {
                info!(hostname = %record.name, "[DNS] Would update {} -> {} (proxied={})", record.record_type, record.content, record.proxied);
            }
            DnsAction::Create(record) => {
                info!(hostname = %record.name, "[DNS] No existing {} record, creating", record.record_type);
                let request = record.to_request();
                self.retry
                    .run("create DNS record", || self.provider.create_dns_record(zone_id, &request))
                    .await?;
                info!(
                    hostname = %record.name,
                    "[DNS] Created {} -> {} (proxied={})", record.record_type, record.content, record.proxied
                );
            }
            DnsAction::Update { record_id, desired: record } => {
                let previous = existing.first().map(|r| r.content.as_str()).unwrap_or_default();
                info!(
                    hostname = %record.name,
                    "[DNS] Updating {} from {} to {} (proxied={})", record.record_type, previous, record.content, record.proxied
                );
                let request = record.to_request();
                self.retry
                    .run("update DNS record", || {
                        self.provider.update_dns_record(zone_id, record_id, &request)
                    })
                    .await?;
                info!(hostname = %record.name, "[DNS] Updated {} record", record.record_type);
            }
        }

        Ok(action)
    }
}
