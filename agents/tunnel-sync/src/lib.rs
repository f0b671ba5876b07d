//! Tunnel Sync Library
//!
//! Keeps a Cloudflare tunnel's ingress rules and the matching DNS records
//! in step with the HTTP routers a Traefik instance serves.

pub mod cloudflare;
pub mod config;
pub mod dns;
pub mod error;
pub mod hostnames;
pub mod ingress;
pub mod retry;
pub mod sync;
pub mod traefik;
pub mod zones;

#[cfg(test)]
mod testing;

pub use cloudflare::{CloudflareClient, TunnelDnsProvider};
pub use config::{Args, Config};
pub use error::{Result, SyncError};
pub use sync::{PassOutcome, PassReport, SyncSettings, Syncer};
pub use traefik::{RouteSource, TraefikClient};
