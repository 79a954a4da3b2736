//! Vigil kernel - machine fleet monitoring backend
//!
//! Bootstraps the full stack: config, persistent store, report pipeline,
//! connection registry, broadcast scheduler and the websocket gateway.
//! Reporters push telemetry in, dashboard clients get the live fleet out.

mod auth;
mod config;
mod events;
mod gateway;
mod geo;
mod health;
mod pipeline;
mod registry;
mod report;
mod scheduler;
mod store;
mod units;
mod validate;

use crate::auth::ApiKeyVerifier;
use crate::config::load_config;
use crate::gateway::GatewayState;
use crate::geo::HttpGeoLookup;
use crate::health::HealthTracker;
use crate::pipeline::ReportPipeline;
use crate::registry::ConnectionRegistry;
use crate::scheduler::BroadcastScheduler;
use crate::store::JsonStore;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil_kernel=info")))
        .init();

    let cfg = load_config().await;

    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("failed to create data dir {}", cfg.data_dir))?;

    // the store is load-bearing: a kernel that cannot persist must not start
    let store = Arc::new(JsonStore::open(&cfg.data_dir).context("failed to open machine store")?);

    let registry = Arc::new(ConnectionRegistry::new());
    let pipeline = Arc::new(ReportPipeline::new(cfg.latest_reporter_version));
    let verifier = Arc::new(ApiKeyVerifier::from_env());
    let geo = cfg.geo_lookup.then(|| Arc::new(HttpGeoLookup::new()));
    let health = HealthTracker::new();

    // heartbeat, machine fan-out, snapshot eviction and speedtest triggers
    let _scheduler = BroadcastScheduler::start(registry.clone(), &cfg);

    let app = gateway::build_router(GatewayState {
        cfg: cfg.clone(),
        registry,
        pipeline,
        store,
        verifier,
        geo,
        health,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.bind_port));
    info!("kernel listening on http://{addr}");
    let listener = TcpListener::bind(addr).await.with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server error")?;
    Ok(())
}
