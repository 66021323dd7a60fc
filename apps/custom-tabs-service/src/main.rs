use anyhow::Context;
use axum::Router;
use custom_tabs_service::config::AppConfig;
use custom_tabs_service::metrics;
use custom_tabs_service::routes;
use custom_tabs_service::state::build_state;
use custom_tabs_service::telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env().context("reading configuration")?;
    init_tracing(&cfg.log_filter);

    let (state, environment) =
        build_state(&cfg, tokio::runtime::Handle::current()).context("building service")?;
    let app: Router = routes::router(state.clone());

    info!(
        addr = %cfg.bind_addr,
        clients = cfg.client_packages.len(),
        asset_links = ?cfg.asset_links,
        spare_surfaces = cfg.spare_surfaces,
        throttle_capacity = cfg.service.throttle_capacity,
        throttle_window_ms = cfg.service.throttle_window.as_millis() as u64,
        hidden_tab_speculation = cfg.service.hidden_tab_speculation,
        throttle_store = %cfg
            .throttle_store_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".into()),
        "starting custom-tabs-service"
    );
    metrics::BOOT_COUNTER.inc();

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    environment.mark_started();

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler failed");
            }
            info!("shutdown requested");
        })
        .await
        .context("serving")?;

    tokio::task::spawn_blocking(move || state.shutdown())
        .await
        .context("stopping connection service")?;
    Ok(())
}
