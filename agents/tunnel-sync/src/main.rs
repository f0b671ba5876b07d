//! Tunnel Sync Agent
//!
//! Watches the HTTP routers of a Traefik instance and publishes their
//! hostnames through a Cloudflare tunnel: ingress rules on the tunnel plus a
//! proxied CNAME per public hostname, or an A record to the backend for
//! hostnames served on a local entrypoint.
//!
//! # Usage
//! ```bash
//! # Continuous sync
//! tunnel-sync --traefik-api-endpoint http://traefik:8080 --entrypoints web,local \
//!     --service-endpoint http://10.0.0.5:80 --tunnel-id <uuid>
//!
//! # Single pass, no writes
//! tunnel-sync --once --dry-run
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tunnel_sync::{
    Args, CloudflareClient, Config, PassOutcome, SyncSettings, Syncer, TraefikClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.log_json);

    info!("🚀 Tunnel Sync starting...");

    let config = Config::from_args(args).context("Invalid configuration")?;
    config.log_summary();

    let routes = TraefikClient::new(&config.traefik_api_endpoint, config.request_timeout)
        .context("Failed to create Traefik client")?;
    let provider = CloudflareClient::new(
        config.api_token.clone(),
        &config.cloudflare_api_base,
        config.request_timeout,
    )
    .context("Failed to create Cloudflare client")?;

    let mut syncer = Syncer::new(SyncSettings::from(&config), routes, provider);

    if config.once {
        return match syncer.run_once().await {
            Ok(PassOutcome::FetchFailed) => bail!("No routers could be fetched from Traefik"),
            Ok(outcome) => {
                info!(?outcome, "✅ Single pass finished");
                Ok(())
            }
            Err(e) => Err(e).context("Sync pass failed"),
        };
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutting down...");
        let _ = shutdown_tx.send(true);
    });

    syncer.run(shutdown_rx).await;

    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
