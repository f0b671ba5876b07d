//! Cloudflare API Client
//!
//! Zones, DNS records and tunnel configuration over the v4 REST API.
//! Every call is a single request that either succeeds or fails as a whole.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::ingress::IngressRule;
use crate::zones::Zone;

/// TTL value meaning "automatic".
pub const AUTO_TTL: u32 = 1;

/// Comment attached to every record written by this agent.
pub const RECORD_COMMENT: &str = "Managed by tunnel-sync";

const ZONES_PER_PAGE: u32 = 50;

/// DNS record types owned by this agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordType {
    A,
    #[allow(clippy::upper_case_acronyms)]
    CNAME,
}

impl std::fmt::Display for DnsRecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsRecordType::A => write!(f, "A"),
            DnsRecordType::CNAME => write!(f, "CNAME"),
        }
    }
}

/// A DNS record from Cloudflare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: DnsRecordType,
    pub content: String,
    #[serde(default)]
    pub ttl: Option<u32>,
    /// Absent for records that cannot be proxied
    #[serde(default)]
    pub proxied: Option<bool>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Request to create/update a DNS record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRecordRequest {
    #[serde(rename = "type")]
    pub record_type: DnsRecordType,
    pub name: String,
    pub content: String,
    pub ttl: u32,
    pub proxied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Tunnel configuration as returned by `GET .../configurations`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TunnelConfiguration {
    #[serde(default)]
    pub tunnel_id: Option<String>,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub config: Option<TunnelConfigBody>,
}

impl TunnelConfiguration {
    /// Current ingress rules; empty when the tunnel has no remote config yet.
    pub fn ingress(&self) -> &[IngressRule] {
        self.config
            .as_ref()
            .map(|c| c.ingress.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfigBody {
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
}

#[derive(Debug, Serialize)]
struct TunnelConfigUpdate<'a> {
    config: TunnelIngressBody<'a>,
}

#[derive(Debug, Serialize)]
struct TunnelIngressBody<'a> {
    ingress: &'a [IngressRule],
}

/// Cloudflare API response wrapper
#[derive(Debug, Deserialize)]
struct CloudflareResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<CloudflareError>,
    result: Option<T>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct CloudflareError {
    #[serde(default)]
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    total_pages: u32,
}

/// Operations the reconciler needs from the DNS/tunnel provider.
#[async_trait]
pub trait TunnelDnsProvider: Send + Sync {
    /// All zones visible to the credential, with their owning account.
    async fn list_zones(&self) -> Result<Vec<Zone>>;

    /// Records of `record_type` named `name` in `zone_id`, in provider order.
    async fn list_dns_records(
        &self,
        zone_id: &str,
        name: &str,
        record_type: DnsRecordType,
    ) -> Result<Vec<DnsRecord>>;

    async fn create_dns_record(&self, zone_id: &str, request: &DnsRecordRequest) -> Result<DnsRecord>;

    async fn update_dns_record(
        &self,
        zone_id: &str,
        record_id: &str,
        request: &DnsRecordRequest,
    ) -> Result<DnsRecord>;

    async fn get_tunnel_config(&self, account_id: &str, tunnel_id: &str) -> Result<TunnelConfiguration>;

    /// Replace the tunnel's whole ingress list.
    async fn update_tunnel_config(
        &self,
        account_id: &str,
        tunnel_id: &str,
        ingress: &[IngressRule],
    ) -> Result<()>;
}

/// Cloudflare Client
pub struct CloudflareClient {
    http_client: Client,
    api_token: String,
    api_base: String,
}

impl CloudflareClient {
    /// Create a new Cloudflare client with API token
    pub fn new(api_token: String, api_base: &str, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent(concat!("tunnel-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http_client,
            api_token,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Send an authenticated request and unwrap the response envelope.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<(T, Option<ResultInfo>)> {
        let response = request.bearer_auth(&self.api_token).send().await?;

        let status = response.status();
        let endpoint = response.url().path().to_string();
        let body = response.text().await?;

        parse_envelope(status, endpoint, body, what)
    }
}

/// Unwrap a response envelope. A body that is not an envelope is reported
/// by status when the status is an error, otherwise as an API error.
fn parse_envelope<T: DeserializeOwned>(
    status: StatusCode,
    endpoint: String,
    body: String,
    what: &str,
) -> Result<(T, Option<ResultInfo>)> {
    let parsed: CloudflareResponse<T> = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(_) if !status.is_success() => {
            return Err(SyncError::Status {
                endpoint,
                status,
                body,
            })
        }
        Err(e) => {
            return Err(SyncError::Api(format!(
                "unparseable response to {}: {}",
                what, e
            )))
        }
    };

    if !parsed.success || !status.is_success() {
        let errors: Vec<String> = parsed
            .errors
            .iter()
            .map(|e| format!("{} (code {})", e.message, e.code))
            .collect();
        return Err(SyncError::Api(format!(
            "{} failed with {}: {}",
            what,
            status,
            errors.join(", ")
        )));
    }

    let result = parsed
        .result
        .ok_or_else(|| SyncError::MissingResult(what.to_string()))?;
    Ok((result, parsed.result_info))
}

/// Page to request after `page`, if any. Without pagination info, or once a
/// page comes back empty, listing stops.
fn next_page(page: u32, fetched: usize, info: Option<&ResultInfo>) -> Option<u32> {
    let total_pages = info.map(|i| i.total_pages.max(i.page)).unwrap_or(page);
    (fetched > 0 && page < total_pages).then_some(page + 1)
}

#[async_trait]
impl TunnelDnsProvider for CloudflareClient {
    async fn list_zones(&self) -> Result<Vec<Zone>> {
        let mut zones = Vec::new();
        let mut page = 1;

        loop {
            let request = self.http_client.get(self.url("/zones")).query(&[
                ("page", page.to_string()),
                ("per_page", ZONES_PER_PAGE.to_string()),
            ]);
            let (batch, info): (Vec<Zone>, _) = self.send(request, "list zones").await?;
            debug!(page, count = batch.len(), "Fetched zones page");

            let fetched = batch.len();
            zones.extend(batch);

            match next_page(page, fetched, info.as_ref()) {
                Some(next) => page = next,
                None => break,
            }
        }

        Ok(zones)
    }

    async fn list_dns_records(
        &self,
        zone_id: &str,
        name: &str,
        record_type: DnsRecordType,
    ) -> Result<Vec<DnsRecord>> {
        let request = self
            .http_client
            .get(self.url(&format!("/zones/{}/dns_records", zone_id)))
            .query(&[("name", name.to_string()), ("type", record_type.to_string())]);

        let (records, _) = self.send(request, "list DNS records").await?;
        Ok(records)
    }

    async fn create_dns_record(&self, zone_id: &str, request: &DnsRecordRequest) -> Result<DnsRecord> {
        let builder = self
            .http_client
            .post(self.url(&format!("/zones/{}/dns_records", zone_id)))
            .json(request);

        let (record, _) = self.send(builder, "create DNS record").await?;
        Ok(record)
    }

    async fn update_dns_record(
        &self,
        zone_id: &str,
        record_id: &str,
        request: &DnsRecordRequest,
    ) -> Result<DnsRecord> {
        let builder = self
            .http_client
            .put(self.url(&format!("/zones/{}/dns_records/{}", zone_id, record_id)))
            .json(request);

        let (record, _) = self.send(builder, "update DNS record").await?;
        Ok(record)
    }

    async fn get_tunnel_config(&self, account_id: &str, tunnel_id: &str) -> Result<TunnelConfiguration> {
        let request = self.http_client.get(self.url(&format!(
            "/accounts/{}/cfd_tunnel/{}/configurations",
            account_id, tunnel_id
        )));

        let (config, _) = self.send(request, "get tunnel configuration").await?;
        Ok(config)
    }

    async fn update_tunnel_config(
        &self,
        account_id: &str,
        tunnel_id: &str,
        ingress: &[IngressRule],
    ) -> Result<()> {
        let body = TunnelConfigUpdate {
            config: TunnelIngressBody { ingress },
        };
        let request = self
            .http_client
            .put(self.url(&format!(
                "/accounts/{}/cfd_tunnel/{}/configurations",
                account_id, tunnel_id
            )))
            .json(&body);

        let _: (serde_json::Value, _) = self.send(request, "update tunnel configuration").await?;
        Ok(())
    }
}
