//! In-memory route source and provider used by the unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::cloudflare::{
    DnsRecord, DnsRecordRequest, DnsRecordType, TunnelConfigBody, TunnelConfiguration,
    TunnelDnsProvider,
};
use crate::error::{Result, SyncError};
use crate::ingress::IngressRule;
use crate::traefik::{Route, RouteSource};
use crate::zones::{Zone, ZoneAccount};

pub fn zone(id: &str, name: &str, account_id: &str, account_name: &str) -> Zone {
    Zone {
        id: id.to_string(),
        name: name.to_string(),
        account: ZoneAccount {
            id: account_id.to_string(),
            name: account_name.to_string(),
        },
    }
}

pub fn route(name: &str, entry_points: &[&str], rule: &str) -> Route {
    Route {
        name: name.to_string(),
        status: "enabled".to_string(),
        entry_points: entry_points.iter().map(|ep| ep.to_string()).collect(),
        rule: rule.to_string(),
        tls: None,
    }
}

/// Route source returning whatever was last set.
#[derive(Default)]
pub struct FakeRoutes {
    routes: Mutex<Vec<Route>>,
    fetches: AtomicUsize,
}

impl FakeRoutes {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: Mutex::new(routes),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, routes: Vec<Route>) {
        *self.routes.lock().unwrap() = routes;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RouteSource for FakeRoutes {
    async fn fetch_routes(&self) -> Vec<Route> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.routes.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct ProviderState {
    zones: Vec<Zone>,
    records: HashMap<String, Vec<DnsRecord>>,
    tunnels: HashMap<(String, String), Vec<IngressRule>>,
    failing_hosts: HashSet<String>,
    failing_tunnel_accounts: HashSet<String>,
    fail_zone_listing: bool,
    next_id: usize,
}

/// Provider keeping zones, records and tunnel configs in memory.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
    calls: AtomicUsize,
    writes: AtomicUsize,
    failed_writes: AtomicUsize,
    tunnel_updates: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zones(zones: Vec<Zone>) -> Self {
        let provider = Self::new();
        provider.state.lock().unwrap().zones = zones;
        provider
    }

    pub fn insert_record(&self, zone_id: &str, record: DnsRecord) {
        self.state
            .lock()
            .unwrap()
            .records
            .entry(zone_id.to_string())
            .or_default()
            .push(record);
    }

    pub fn set_tunnel_ingress(&self, account_id: &str, tunnel_id: &str, ingress: Vec<IngressRule>) {
        self.state
            .lock()
            .unwrap()
            .tunnels
            .insert((account_id.to_string(), tunnel_id.to_string()), ingress);
    }

    pub fn fail_dns_writes_for(&self, hostname: &str) {
        self.state.lock().unwrap().failing_hosts.insert(hostname.to_string());
    }

    pub fn fail_tunnel_updates_for(&self, account_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_tunnel_accounts
            .insert(account_id.to_string());
    }

    pub fn fail_zone_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_zone_listing = fail;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_hosts.clear();
        state.failing_tunnel_accounts.clear();
        state.fail_zone_listing = false;
    }

    pub fn records(&self, zone_id: &str) -> Vec<DnsRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(zone_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tunnel_ingress(&self, account_id: &str, tunnel_id: &str) -> Option<Vec<IngressRule>> {
        self.state
            .lock()
            .unwrap()
            .tunnels
            .get(&(account_id.to_string(), tunnel_id.to_string()))
            .cloned()
    }

    /// Every provider call, reads included.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Successful DNS writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn failed_write_count(&self) -> usize {
        self.failed_writes.load(Ordering::SeqCst)
    }

    /// Successful tunnel configuration updates.
    pub fn tunnel_update_count(&self) -> usize {
        self.tunnel_updates.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn check_dns_write(&self, name: &str) -> Result<()> {
        if self.state.lock().unwrap().failing_hosts.contains(name) {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(SyncError::Api(format!("write rejected for {}", name)));
        }
        Ok(())
    }

    fn to_record(id: String, request: &DnsRecordRequest) -> DnsRecord {
        DnsRecord {
            id,
            name: request.name.clone(),
            record_type: request.record_type,
            content: request.content.clone(),
            ttl: Some(request.ttl),
            proxied: Some(request.proxied),
            comment: request.comment.clone(),
        }
    }
}

#[async_trait]
impl TunnelDnsProvider for FakeProvider {
    async fn list_zones(&self) -> Result<Vec<Zone>> {
        self.record_call();
        let state = self.state.lock().unwrap();
        if state.fail_zone_listing {
            return Err(SyncError::Api("zone listing unavailable".to_string()));
        }
        Ok(state.zones.clone())
    }

    async fn list_dns_records(
        &self,
        zone_id: &str,
        name: &str,
        record_type: DnsRecordType,
    ) -> Result<Vec<DnsRecord>> {
        self.record_call();
        Ok(self
            .records(zone_id)
            .into_iter()
            .filter(|r| r.name == name && r.record_type == record_type)
            .collect())
    }

    async fn create_dns_record(&self, zone_id: &str, request: &DnsRecordRequest) -> Result<DnsRecord> {
        self.record_call();
        self.check_dns_write(&request.name)?;

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let record = Self::to_record(format!("rec-{}", state.next_id), request);
        state
            .records
            .entry(zone_id.to_string())
            .or_default()
            .push(record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn update_dns_record(
        &self,
        zone_id: &str,
        record_id: &str,
        request: &DnsRecordRequest,
    ) -> Result<DnsRecord> {
        self.record_call();
        self.check_dns_write(&request.name)?;

        let mut state = self.state.lock().unwrap();
        let stored = state
            .records
            .get_mut(zone_id)
            .and_then(|records| records.iter_mut().find(|r| r.id == record_id))
            .ok_or_else(|| SyncError::Api(format!("record {} not found", record_id)))?;
        *stored = Self::to_record(record_id.to_string(), request);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }

    async fn get_tunnel_config(&self, account_id: &str, tunnel_id: &str) -> Result<TunnelConfiguration> {
        self.record_call();
        Ok(TunnelConfiguration {
            tunnel_id: Some(tunnel_id.to_string()),
            version: None,
            config: self
                .tunnel_ingress(account_id, tunnel_id)
                .map(|ingress| TunnelConfigBody { ingress }),
        })
    }

    async fn update_tunnel_config(
        &self,
        account_id: &str,
        tunnel_id: &str,
        ingress: &[IngressRule],
    ) -> Result<()> {
        self.record_call();
        if self
            .state
            .lock()
            .unwrap()
            .failing_tunnel_accounts
            .contains(account_id)
        {
            return Err(SyncError::Api(format!("tunnel update rejected for {}", account_id)));
        }

        self.set_tunnel_ingress(account_id, tunnel_id, ingress.to_vec());
        self.tunnel_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Local HTTP server answering successive connections with canned
/// `(status, body)` responses, in order.
pub struct CannedServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl CannedServer {
    pub async fn start(responses: Vec<(u16, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };

                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                }
                let request_line = String::from_utf8_lossy(&request)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                seen.lock().unwrap().push(request_line);

                let response = format!(
                    "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        Self { base_url, requests }
    }

    /// Request lines received so far (`GET /path?query HTTP/1.1`).
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}
