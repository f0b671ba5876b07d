//! Configuration for tunnel-sync.
//!
//! Every setting is read once at startup, either from a flag or from the
//! environment variable of the same meaning, and validated into a [`Config`]
//! value that is handed to the components that need it.

use clap::Parser;
use reqwest::Url;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, SyncError};

pub const DEFAULT_CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";

const DEFAULT_POLL_INTERVAL: u64 = 10;
const MIN_POLL_INTERVAL: u64 = 1;
const MAX_POLL_INTERVAL: u64 = 3600;

/// Raw command line / environment arguments.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "tunnel-sync")]
#[command(about = "Syncs Traefik routers to a Cloudflare tunnel and its DNS records", long_about = None)]
#[command(version)]
pub struct Args {
    /// Cloudflare API token (Zone.DNS edit, Cloudflare Tunnel edit)
    #[arg(long, env = "CLOUDFLARE_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// ID of the tunnel whose ingress is managed
    #[arg(long, env = "CLOUDFLARE_TUNNEL_ID")]
    pub tunnel_id: Option<String>,

    /// Restrict reconciliation to zones owned by this account
    #[arg(long, env = "CLOUDFLARE_ACCOUNT_ID")]
    pub account_id: Option<String>,

    /// Cloudflare API base URL
    #[arg(long, env = "CLOUDFLARE_API_BASE", default_value = DEFAULT_CLOUDFLARE_API)]
    pub cloudflare_api_base: String,

    /// Traefik API endpoint (e.g. http://traefik:8080)
    #[arg(long, env = "TRAEFIK_API_ENDPOINT")]
    pub traefik_api_endpoint: Option<String>,

    /// Comma separated entrypoints whose routers are published
    #[arg(long, env = "TRAEFIK_ENTRYPOINTS")]
    pub entrypoints: Option<String>,

    /// Single entrypoint, used when no list is given
    #[arg(long, env = "TRAEFIK_ENTRYPOINT")]
    pub entrypoint: Option<String>,

    /// Backend service the tunnel forwards to (e.g. http://10.0.0.5:80)
    #[arg(long, env = "TRAEFIK_SERVICE_ENDPOINT")]
    pub service_endpoint: Option<String>,

    /// Observe TLS-terminated routers ("true" or "false")
    #[arg(long, env = "SKIP_TLS_ROUTES", default_value = "true")]
    pub skip_tls_routes: String,

    /// Seconds between reconciliation passes (1-3600)
    #[arg(long, env = "POLL_INTERVAL", default_value = "10")]
    pub poll_interval: String,

    /// Upper bound in seconds for the backoff after failed passes
    #[arg(long, env = "MAX_BACKOFF", default_value = "20")]
    pub max_backoff: u64,

    /// Timeout in seconds for every HTTP request
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "10")]
    pub request_timeout: u64,

    /// Run a single pass and exit
    #[arg(long, env = "SYNC_ONCE")]
    pub once: bool,

    /// Log intended writes without performing them
    #[arg(long, env = "DRY_RUN")]
    pub dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

/// Validated configuration.
#[derive(Clone)]
pub struct Config {
    pub api_token: String,
    pub tunnel_id: String,
    pub account_id: Option<String>,
    pub cloudflare_api_base: String,
    pub traefik_api_endpoint: String,
    pub entrypoints: Vec<String>,
    pub service_endpoint: String,
    /// Host part of `service_endpoint`, used as A record content for local hostnames
    pub local_address: String,
    pub skip_tls_routes: bool,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
    pub once: bool,
    pub dry_run: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_token", &"<redacted>")
            .field("tunnel_id", &self.tunnel_id)
            .field("account_id", &self.account_id)
            .field("cloudflare_api_base", &self.cloudflare_api_base)
            .field("traefik_api_endpoint", &self.traefik_api_endpoint)
            .field("entrypoints", &self.entrypoints)
            .field("service_endpoint", &self.service_endpoint)
            .field("local_address", &self.local_address)
            .field("skip_tls_routes", &self.skip_tls_routes)
            .field("poll_interval", &self.poll_interval)
            .field("max_backoff", &self.max_backoff)
            .field("request_timeout", &self.request_timeout)
            .field("once", &self.once)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl Config {
    /// Validate raw arguments. Missing required settings are reported together.
    pub fn from_args(args: Args) -> Result<Self> {
        let api_token = non_blank(args.api_token);
        let tunnel_id = non_blank(args.tunnel_id);
        let traefik_api_endpoint = non_blank(args.traefik_api_endpoint);
        let service_endpoint = non_blank(args.service_endpoint);
        let entrypoints = parse_entrypoints(args.entrypoints.as_deref(), args.entrypoint.as_deref());

        let missing: Vec<&str> = [
            ("CLOUDFLARE_API_TOKEN", api_token.is_none()),
            ("CLOUDFLARE_TUNNEL_ID", tunnel_id.is_none()),
            ("TRAEFIK_API_ENDPOINT", traefik_api_endpoint.is_none()),
            ("TRAEFIK_ENTRYPOINTS or TRAEFIK_ENTRYPOINT", entrypoints.is_empty()),
            ("TRAEFIK_SERVICE_ENDPOINT", service_endpoint.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        let (api_token, tunnel_id, traefik_api_endpoint, service_endpoint) =
            match (api_token, tunnel_id, traefik_api_endpoint, service_endpoint) {
                (Some(token), Some(tunnel), Some(traefik), Some(service)) if missing.is_empty() => {
                    (token, tunnel, traefik, service)
                }
                _ => return Err(missing_settings(&missing)),
            };

        let local_address = extract_host(&service_endpoint);
        if local_address.parse::<Ipv4Addr>().is_err() {
            warn!(
                local_address = %local_address,
                "Service endpoint host is not an IPv4 address; A records for local hostnames may be rejected"
            );
        }

        Ok(Self {
            api_token,
            tunnel_id,
            account_id: non_blank(args.account_id),
            cloudflare_api_base: args.cloudflare_api_base.trim().trim_end_matches('/').to_string(),
            traefik_api_endpoint,
            entrypoints,
            service_endpoint,
            local_address,
            skip_tls_routes: parse_skip_tls(&args.skip_tls_routes),
            poll_interval: Duration::from_secs(parse_poll_interval(&args.poll_interval)),
            max_backoff: Duration::from_secs(args.max_backoff.max(1)),
            request_timeout: Duration::from_secs(args.request_timeout.max(1)),
            once: args.once,
            dry_run: args.dry_run,
        })
    }

    /// Log the effective settings (never the token).
    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("- Traefik API: {}", self.traefik_api_endpoint);
        info!("- Entrypoints: {:?}", self.entrypoints);
        info!("- Service Endpoint: {}", self.service_endpoint);
        info!("- Local Address: {}", self.local_address);
        info!("- Tunnel ID: {}", self.tunnel_id);
        if let Some(account_id) = &self.account_id {
            info!("- Account ID: {}", account_id);
        }
        info!("- Skip TLS Routes: {}", self.skip_tls_routes);
        info!("- Poll Interval: {}s", self.poll_interval.as_secs());
        if self.dry_run {
            info!("- Dry run: no changes will be written");
        }
    }
}

fn missing_settings(missing: &[&str]) -> SyncError {
    SyncError::Config(format!(
        "missing required settings: {}",
        missing.join(", ")
    ))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// The comma separated list wins; the single entrypoint is the fallback.
pub fn parse_entrypoints(list: Option<&str>, single: Option<&str>) -> Vec<String> {
    let from_list: Vec<String> = list
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|ep| !ep.is_empty())
        .map(String::from)
        .collect();

    if !from_list.is_empty() {
        return from_list;
    }

    single
        .map(str::trim)
        .filter(|ep| !ep.is_empty())
        .map(|ep| vec![ep.to_string()])
        .unwrap_or_default()
}

/// Anything other than `true`/`false` falls back to `true`.
pub fn parse_skip_tls(value: &str) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => true,
        "false" => false,
        other => {
            warn!("Invalid SKIP_TLS_ROUTES value: {}. Using default: true", other);
            true
        }
    }
}

/// Seconds, clamped to [1, 3600]; unparseable input uses the default.
pub fn parse_poll_interval(value: &str) -> u64 {
    match value.trim().parse::<i64>() {
        Ok(secs) if secs < MIN_POLL_INTERVAL as i64 => {
            warn!("POLL_INTERVAL too low, setting to minimum of {} second", MIN_POLL_INTERVAL);
            MIN_POLL_INTERVAL
        }
        Ok(secs) if secs > MAX_POLL_INTERVAL as i64 => {
            warn!("POLL_INTERVAL too high, setting to maximum of {} seconds", MAX_POLL_INTERVAL);
            MAX_POLL_INTERVAL
        }
        Ok(secs) => secs as u64,
        Err(_) => {
            warn!("Invalid POLL_INTERVAL, using default {}s", DEFAULT_POLL_INTERVAL);
            DEFAULT_POLL_INTERVAL
        }
    }
}

/// Host of a URL-ish endpoint without scheme, port or path.
pub fn extract_host(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return String::new();
    }

    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };

    match Url::parse(&with_scheme) {
        Ok(url) => match url.host_str() {
            Some(host) => host.trim_start_matches('[').trim_end_matches(']').to_string(),
            None => endpoint.to_string(),
        },
        Err(_) => endpoint.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_args() -> Args {
        Args {
            api_token: Some("token".to_string()),
            tunnel_id: Some("T1".to_string()),
            account_id: None,
            cloudflare_api_base: format!("{}/", DEFAULT_CLOUDFLARE_API),
            traefik_api_endpoint: Some("http://traefik:8080".to_string()),
            entrypoints: Some("web, local ,,".to_string()),
            entrypoint: None,
            service_endpoint: Some("http://10.0.0.5:80".to_string()),
            skip_tls_routes: "TRUE".to_string(),
            poll_interval: "30".to_string(),
            max_backoff: 20,
            request_timeout: 10,
            ..Args::default()
        }
    }

    #[test]
    fn test_from_args_complete() {
        let config = Config::from_args(complete_args()).unwrap();

        assert_eq!(config.entrypoints, vec!["web", "local"]);
        assert_eq!(config.local_address, "10.0.0.5");
        assert_eq!(config.cloudflare_api_base, DEFAULT_CLOUDFLARE_API);
        assert!(config.skip_tls_routes);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert!(config.account_id.is_none());
    }

    #[test]
    fn test_from_args_reports_all_missing() {
        let args = Args {
            api_token: Some("   ".to_string()),
            service_endpoint: Some("http://10.0.0.5".to_string()),
            ..Args::default()
        };

        let err = Config::from_args(args).unwrap_err().to_string();
        assert!(err.contains("CLOUDFLARE_API_TOKEN"));
        assert!(err.contains("CLOUDFLARE_TUNNEL_ID"));
        assert!(err.contains("TRAEFIK_API_ENDPOINT"));
        assert!(err.contains("TRAEFIK_ENTRYPOINTS or TRAEFIK_ENTRYPOINT"));
        assert!(!err.contains("TRAEFIK_SERVICE_ENDPOINT"));
    }

    #[test]
    fn test_from_args_requires_entrypoints() {
        let args = Args {
            entrypoints: Some(" , ".to_string()),
            ..complete_args()
        };

        let err = Config::from_args(args).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_from_args_single_missing_setting() {
        let args = Args {
            service_endpoint: None,
            ..complete_args()
        };

        match Config::from_args(args) {
            Err(SyncError::Config(message)) => {
                assert_eq!(message, "missing required settings: TRAEFIK_SERVICE_ENDPOINT")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = Config::from_args(complete_args()).unwrap();
        let rendered = format!("{:?}", config);

        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("\"token\""));
    }

    #[test]
    fn test_parse_entrypoints_fallback() {
        assert_eq!(parse_entrypoints(None, Some(" web ")), vec!["web"]);
        assert_eq!(parse_entrypoints(Some(""), Some("web")), vec!["web"]);
        assert_eq!(parse_entrypoints(Some("a,b"), Some("c")), vec!["a", "b"]);
        assert!(parse_entrypoints(None, Some("  ")).is_empty());
    }

    #[test]
    fn test_parse_skip_tls() {
        assert!(parse_skip_tls("true"));
        assert!(!parse_skip_tls("False"));
        assert!(parse_skip_tls("nope"));
    }

    #[test]
    fn test_parse_poll_interval_clamps() {
        assert_eq!(parse_poll_interval("0"), 1);
        assert_eq!(parse_poll_interval("-5"), 1);
        assert_eq!(parse_poll_interval("7200"), 3600);
        assert_eq!(parse_poll_interval("abc"), 10);
        assert_eq!(parse_poll_interval(" 15 "), 15);
    }

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host("http://10.0.0.5:80"), "10.0.0.5");
        assert_eq!(extract_host("https://traefik.internal/path"), "traefik.internal");
        assert_eq!(extract_host("192.168.1.2:8080"), "192.168.1.2");
        assert_eq!(extract_host("192.168.1.2"), "192.168.1.2");
        assert_eq!(extract_host(""), "");
    }
}
