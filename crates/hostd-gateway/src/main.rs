use color_eyre::eyre;
use hostd_gateway::{create_app, AppState, GatewayConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hostd_gateway=debug")),
        )
        .init();

    let config = GatewayConfig::from_env()?;
    info!(
        "Starting hostd member {} ({})",
        config.node_name, config.advertise_address
    );

    let state = Arc::new(AppState::in_memory(&config).await);
    let _pruner = state.registry.spawn_pruner(config.prune_interval);
    info!(
        "Operation retention {:?}, pruning every {:?}",
        config.operation_retention, config.prune_interval
    );

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!("hostd listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
