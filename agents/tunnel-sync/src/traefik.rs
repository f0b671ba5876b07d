//! Traefik API Client
//!
//! Reads the HTTP routers Traefik currently serves. A failed fetch is logged
//! and reported as an empty router list; callers treat that as "try again
//! later", never as "nothing should be published".

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{Result, SyncError};

/// Entrypoint of Traefik's own dashboard/API.
const MANAGEMENT_ENTRYPOINT: &str = "traefik";

/// One HTTP router as reported by `GET /api/http/routers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub entry_points: Vec<String>,
    #[serde(default)]
    pub rule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouteTls>,
}

/// Router TLS settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_resolver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<TlsDomain>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsDomain {
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub sans: Vec<String>,
}

impl Route {
    pub fn is_enabled(&self) -> bool {
        self.status == "enabled"
    }

    /// A router counts as TLS-terminated only when it names a certificate
    /// resolver and also carries TLS options or domains.
    pub fn has_tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| {
            let resolver = tls.cert_resolver.as_deref().is_some_and(|r| !r.is_empty());
            let options = tls.options.as_deref().is_some_and(|o| !o.is_empty());
            resolver && (options || !tls.domains.is_empty())
        })
    }

    /// Routers bound only to Traefik's own management entrypoint.
    pub fn is_management_only(&self) -> bool {
        !self.entry_points.is_empty()
            && self
                .entry_points
                .iter()
                .all(|ep| ep == MANAGEMENT_ENTRYPOINT)
    }
}

/// Source of the proxy's current routers.
#[async_trait]
pub trait RouteSource: Send + Sync {
    /// Publicly reachable routers, or an empty list when the fetch failed.
    async fn fetch_routes(&self) -> Vec<Route>;
}

/// Traefik API client
pub struct TraefikClient {
    http_client: Client,
    api_endpoint: String,
}

impl TraefikClient {
    pub fn new(api_endpoint: &str, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent(concat!("tunnel-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http_client,
            api_endpoint: api_endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn routers_url(&self) -> String {
        format!("{}/api/http/routers", self.api_endpoint)
    }

    async fn get_routers(&self) -> Result<Vec<Route>> {
        let url = self.routers_url();
        let response = self.http_client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Status {
                endpoint: url,
                status,
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl RouteSource for TraefikClient {
    async fn fetch_routes(&self) -> Vec<Route> {
        match self.get_routers().await {
            Ok(routers) => filter_public_routes(routers),
            Err(SyncError::Http(e)) if e.is_connect() => {
                error!(
                    endpoint = %self.api_endpoint,
                    "Connection failed to Traefik API; check that Traefik is running and reachable"
                );
                Vec::new()
            }
            Err(SyncError::Http(e)) if e.is_timeout() => {
                error!(endpoint = %self.api_endpoint, "Timed out while fetching Traefik routers");
                Vec::new()
            }
            Err(SyncError::Http(e)) if e.is_decode() => {
                error!(error = %e, "Failed to parse JSON response from Traefik API");
                Vec::new()
            }
            Err(e) => {
                error!(endpoint = %self.api_endpoint, error = %e, "Failed to fetch routers from Traefik API");
                Vec::new()
            }
        }
    }
}

/// Drop routers that only serve Traefik's own dashboard.
pub fn filter_public_routes(routers: Vec<Route>) -> Vec<Route> {
    routers
        .into_iter()
        .filter(|router| {
            if router.is_management_only() {
                debug!(router = %router.name, entrypoints = ?router.entry_points, "Router excluded");
                false
            } else {
                debug!(router = %router.name, entrypoints = ?router.entry_points, "Router included");
                true
            }
        })
        .collect()
}
