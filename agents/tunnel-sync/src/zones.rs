//! Zone directory: resolves hostnames to the Cloudflare zone that owns them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::hostnames::{normalize_hostname, ClassifiedHost};

/// Account owning a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneAccount {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A DNS zone visible to the API token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub account: ZoneAccount,
}

/// A hostname resolved to its owning zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainMatch {
    pub host: ClassifiedHost,
    pub zone_id: String,
    pub account_id: String,
    pub account_name: String,
    /// Name of the matched zone
    pub root_domain: String,
}

impl DomainMatch {
    pub fn hostname(&self) -> &str {
        &self.host.hostname
    }
}

/// Matched hostnames of one account, in order of first appearance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBatch {
    pub account_id: String,
    pub account_name: String,
    pub matches: Vec<DomainMatch>,
}

/// Zone lookup by name.
#[derive(Debug, Clone, Default)]
pub struct ZoneDirectory {
    by_name: HashMap<String, Zone>,
}

impl ZoneDirectory {
    /// Index zones by lowercase name. The first zone wins on duplicate names.
    pub fn new(zones: Vec<Zone>) -> Self {
        let mut by_name = HashMap::with_capacity(zones.len());
        for zone in zones {
            let key = normalize_hostname(&zone.name);
            if by_name.contains_key(&key) {
                debug!(zone = %zone.name, account = %zone.account.name, "Ignoring duplicate zone name");
                continue;
            }
            by_name.insert(key, zone);
        }
        Self { by_name }
    }

    /// Most specific zone owning `host`, if any.
    pub fn match_zone(&self, host: &ClassifiedHost) -> Option<DomainMatch> {
        candidate_domains(&normalize_hostname(&host.hostname))
            .into_iter()
            .find_map(|candidate| self.by_name.get(&candidate))
            .map(|zone| DomainMatch {
                host: host.clone(),
                zone_id: zone.id.clone(),
                account_id: zone.account.id.clone(),
                account_name: zone.account.name.clone(),
                root_domain: zone.name.clone(),
            })
    }

    /// Resolve all hosts; hosts without a zone are logged and dropped.
    pub fn match_all(&self, hosts: &[ClassifiedHost]) -> Vec<DomainMatch> {
        hosts
            .iter()
            .filter_map(|host| match self.match_zone(host) {
                Some(m) => {
                    info!(
                        hostname = %m.hostname(),
                        zone = %m.root_domain,
                        account = %m.account_name,
                        "Matched hostname to zone"
                    );
                    Some(m)
                }
                None => {
                    warn!(hostname = %host.hostname, "No matching zone found for hostname");
                    None
                }
            })
            .collect()
    }
}

/// `a.b.example.com` -> `[a.b.example.com, b.example.com, example.com]`.
/// The bare top-level label is never a candidate.
pub fn candidate_domains(hostname: &str) -> Vec<String> {
    let labels: Vec<&str> = hostname.split('.').collect();
    (0..labels.len().saturating_sub(1))
        .map(|i| labels[i..].join("."))
        .collect()
}

/// Keep only zones of `account_id` when one is configured.
pub fn filter_by_account(zones: Vec<Zone>, account_id: Option<&str>) -> Vec<Zone> {
    match account_id {
        Some(account_id) => zones
            .into_iter()
            .filter(|zone| zone.account.id == account_id)
            .collect(),
        None => zones,
    }
}

/// Group matches per account, keeping first-appearance order.
pub fn group_by_account(matches: Vec<DomainMatch>) -> Vec<AccountBatch> {
    let mut batches: Vec<AccountBatch> = Vec::new();
    for m in matches {
        match batches.iter_mut().find(|b| b.account_id == m.account_id) {
            Some(batch) => batch.matches.push(m),
            None => batches.push(AccountBatch {
                account_id: m.account_id.clone(),
                account_name: m.account_name.clone(),
                matches: vec![m],
            }),
        }
    }
    batches
}

/// Log zones grouped by account.
pub fn log_zones(zones: &[Zone]) {
    let mut accounts: Vec<(&ZoneAccount, Vec<&str>)> = Vec::new();
    for zone in zones {
        match accounts.iter_mut().find(|entry| entry.0.id == zone.account.id) {
            Some((_, names)) => names.push(zone.name.as_str()),
            None => accounts.push((&zone.account, vec![zone.name.as_str()])),
        }
    }

    for (account, names) in accounts {
        info!(account = %account.name, account_id = %account.id, zones = ?names, "Available zones");
    }
}
