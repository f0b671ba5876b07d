//! Tunnel ingress planning.
//!
//! The planned list holds one rule per public hostname, in order of first
//! appearance, followed by exactly one catch-all rule.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;

use crate::hostnames::ClassifiedHost;

/// Service of the trailing catch-all rule.
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

/// Per-rule origin settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginRequest {
    #[serde(rename = "noTLSVerify", default, skip_serializing_if = "Option::is_none")]
    pub no_tls_verify: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_host_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_name: Option<String>,
}

/// One ingress rule of a tunnel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_request: Option<OriginRequest>,
}

impl IngressRule {
    /// Route `hostname` to `service`, presenting the hostname to the origin.
    /// Origin certificate verification is off because the tunnel terminates TLS.
    pub fn for_host(hostname: &str, service: &str) -> Self {
        Self {
            hostname: Some(hostname.to_string()),
            service: service.to_string(),
            origin_request: Some(OriginRequest {
                no_tls_verify: Some(true),
                http_host_header: Some(hostname.to_string()),
                origin_server_name: Some(hostname.to_string()),
            }),
        }
    }

    pub fn catch_all() -> Self {
        Self {
            hostname: None,
            service: CATCH_ALL_SERVICE.to_string(),
            origin_request: None,
        }
    }

    pub fn is_catch_all(&self) -> bool {
        self.hostname.is_none()
    }

    fn same_as(&self, other: &IngressRule) -> bool {
        self.hostname == other.hostname
            && self.service == other.service
            && self.origin_request.clone().unwrap_or_default()
                == other.origin_request.clone().unwrap_or_default()
    }
}

/// Plan the ingress list for one account's tunnel.
///
/// Local hostnames are left out; repeated hostnames keep their first position.
pub fn plan_ingress<'a>(
    hosts: impl IntoIterator<Item = &'a ClassifiedHost>,
    service_endpoint: &str,
) -> Vec<IngressRule> {
    let mut seen = HashSet::new();
    let mut ingress = Vec::new();

    for host in hosts {
        if host.is_local() {
            info!(hostname = %host.hostname, "Skipping tunnel ingress for local/office hostname");
            continue;
        }
        if !seen.insert(host.hostname.as_str()) {
            info!(hostname = %host.hostname, "Skipping duplicate hostname");
            continue;
        }

        info!(hostname = %host.hostname, service = %service_endpoint, "Adding hostname to tunnel");
        ingress.push(IngressRule::for_host(&host.hostname, service_endpoint));
    }

    ingress.push(IngressRule::catch_all());
    ingress
}

/// Whether two ingress lists route identically. An absent origin request
/// equals an empty one.
pub fn same_ingress(current: &[IngressRule], planned: &[IngressRule]) -> bool {
    current.len() == planned.len() && current.iter().zip(planned).all(|(a, b)| a.same_as(b))
}
