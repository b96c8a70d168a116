use anyhow::Context;
use safiri_api::{
    app,
    state::{payment_gateway, AppState, Backends},
};
use safiri_booking::ExpirySweeper;
use safiri_core::clock::SystemClock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "safiri_api=debug,safiri_booking=debug,tower_http=debug,axum::rejection=trace".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = safiri_store::app_config::Config::load().context("Failed to load config")?;
    tracing::info!("Starting Safiri API on port {}", config.server.port);

    let backends = Backends::connect(&config).await?;
    let app_state = AppState::new(
        &config,
        backends,
        payment_gateway(&config),
        Arc::new(SystemClock),
    )?;

    // Expiry sweeper
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Arc::new(
        ExpirySweeper::new(
            app_state.ledger.clone(),
            Duration::from_secs(config.business_rules.sweep_interval_seconds),
        )
        .with_workflow(app_state.workflow.clone()),
    );
    let metrics = app_state.metrics.clone();
    let sweeper_handle = sweeper.start(shutdown_rx, move |report| metrics.record_sweep(report));

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = sweeper_handle.await;
    Ok(())
}
