//! Hostname extraction from Traefik router rules.
//!
//! Only the literal arguments of host matchers (`Host(...)`, or the generic
//! `Match(...)` spelling) are read. The boolean structure of the rule
//! (`&&`, `||`, `!`) is not evaluated. Hostnames are compared in their
//! normalized form: trimmed, lowercase, without a trailing dot.

use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::traefik::Route;

/// Entrypoints whose hostnames are served on the internal network.
pub const LOCAL_ENTRYPOINTS: [&str; 2] = ["local", "office"];

/// Where a hostname is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKind {
    /// Reached through the tunnel (proxied CNAME)
    Public,
    /// Reached directly on the internal network (A record)
    Local,
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKind::Public => write!(f, "public"),
            HostKind::Local => write!(f, "local/office"),
        }
    }
}

/// A hostname together with its classification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassifiedHost {
    pub hostname: String,
    pub kind: HostKind,
}

impl ClassifiedHost {
    pub fn public(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            kind: HostKind::Public,
        }
    }

    pub fn local(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            kind: HostKind::Local,
        }
    }

    pub fn is_local(&self) -> bool {
        self.kind == HostKind::Local
    }
}

/// Router filtering settings.
#[derive(Debug, Clone, Default)]
pub struct ExtractionPolicy {
    /// Entrypoint allow-list; empty means every entrypoint qualifies
    pub entrypoints: Vec<String>,
    pub skip_tls_routes: bool,
}

impl ExtractionPolicy {
    pub fn new(entrypoints: Vec<String>, skip_tls_routes: bool) -> Self {
        Self {
            entrypoints,
            skip_tls_routes,
        }
    }

    pub fn has_matching_entrypoint(&self, router_eps: &[String]) -> bool {
        self.entrypoints.is_empty() || router_eps.iter().any(|ep| self.entrypoints.contains(ep))
    }
}

/// Deduplicated hostnames of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedHostnames {
    /// Unique hostnames in order of first appearance
    hostnames: Vec<String>,
    local: HashSet<String>,
}

impl ExtractedHostnames {
    pub fn is_empty(&self) -> bool {
        self.hostnames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hostnames.len()
    }

    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    pub fn local_hostnames(&self) -> &HashSet<String> {
        &self.local
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.hostnames.iter().any(|h| h == hostname)
    }

    pub fn is_local(&self, hostname: &str) -> bool {
        self.local.contains(hostname)
    }

    pub fn kind_of(&self, hostname: &str) -> HostKind {
        if self.is_local(hostname) {
            HostKind::Local
        } else {
            HostKind::Public
        }
    }

    /// Hostnames with classification, in order of first appearance.
    pub fn classified(&self) -> Vec<ClassifiedHost> {
        self.hostnames
            .iter()
            .map(|hostname| ClassifiedHost {
                hostname: hostname.clone(),
                kind: self.kind_of(hostname),
            })
            .collect()
    }

    fn add(&mut self, hostname: &str, local: bool) {
        if !self.contains(hostname) {
            self.hostnames.push(hostname.to_string());
        }
        if local {
            self.local.insert(hostname.to_string());
        }
    }
}

fn host_call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:Host|Match)\(([^)]*)\)").expect("valid host matcher regex")
    })
}

fn quoted_arg_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([^`]+)`").expect("valid backtick regex"))
}

/// DNS names are case-insensitive; `A.Example.com.` and `a.example.com` are one host.
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Every backtick-quoted argument of every host matcher call in `rule`,
/// normalized.
pub fn parse_rule_hosts(rule: &str) -> Vec<String> {
    host_call_regex()
        .captures_iter(rule)
        .filter_map(|call| call.get(1))
        .flat_map(|args| {
            quoted_arg_regex()
                .captures_iter(args.as_str())
                .filter_map(|arg| arg.get(1))
                .map(|m| normalize_hostname(m.as_str()))
                .filter(|host| !host.is_empty())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Collect the hostnames of all enabled routers on allowed entrypoints.
///
/// A hostname contributed by any router on a `local`/`office` entrypoint is
/// classified as local. TLS-terminated routers are only reported in the logs
/// when `skip_tls_routes` is set; their hostnames are still collected.
pub fn extract_hostnames(routes: &[Route], policy: &ExtractionPolicy) -> ExtractedHostnames {
    let mut extracted = ExtractedHostnames::default();

    for route in routes {
        if !route.is_enabled() {
            debug!(router = %route.name, status = %route.status, "Skipping disabled router");
            continue;
        }

        if policy.skip_tls_routes && route.has_tls_enabled() {
            debug!(router = %route.name, "Router is TLS-enabled; keeping its hostnames");
        }

        if !policy.has_matching_entrypoint(&route.entry_points) {
            info!(
                router = %route.name,
                entrypoints = ?route.entry_points,
                "Skipping router with non-matching entrypoints"
            );
            continue;
        }

        let hosts = parse_rule_hosts(&route.rule);
        if hosts.is_empty() {
            debug!(router = %route.name, rule = %route.rule, "No Host matcher in router rule");
            continue;
        }

        let local = route
            .entry_points
            .iter()
            .any(|ep| LOCAL_ENTRYPOINTS.contains(&ep.as_str()));
        if local {
            info!(router = %route.name, "Router has local/office entrypoint");
        }

        for host in &hosts {
            extracted.add(host, local);
        }
        debug!(router = %route.name, hosts = ?hosts, "Added hostnames from router");
    }

    extracted
}
