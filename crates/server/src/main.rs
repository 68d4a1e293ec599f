use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use server::app::{build_app, AppState};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vaultgate_core::{
    cache::ResponseCache,
    config::{PROXY_ADDR, PROXY_PORT, UPSTREAM_ADDR, UPSTREAM_PORT, UPSTREAM_ROOT_TOKEN},
    dispatch::Dispatcher,
    membership::PeerDirectory,
    ratelimit::VisitorRegistry,
};

#[derive(Parser)]
#[command(name = "vaultgate")]
#[command(about = "Caching, rate-limiting sidecar proxy for a clustered secret store")]
struct Args {
    /// Listen address of this proxy, host:port. Peers route to this
    /// address, so it must match what the membership rewrite produces.
    #[arg(short, long, default_value_t = default_addr())]
    addr: String,
}

fn default_addr() -> String {
    format!("{PROXY_ADDR}:{PROXY_PORT}")
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vaultgate_core=info,server=info"));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let upstream_base = format!("http://{UPSTREAM_ADDR}:{UPSTREAM_PORT}");
    let client = reqwest::Client::new();

    let cache = Arc::new(ResponseCache::new());
    let limiters = Arc::new(VisitorRegistry::new());
    let peers = Arc::new(PeerDirectory::new(
        args.addr.clone(),
        upstream_base.clone(),
        UPSTREAM_ROOT_TOKEN.to_string(),
        client.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(client, upstream_base));

    // Membership refreshes on its own task; requests never pay the latency.
    let refresher = peers.clone().spawn_refresher();

    let app = build_app(AppState { cache, limiters, peers, dispatcher });

    info!(address = %args.addr, "vaultgate listening");
    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    refresher.abort();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
