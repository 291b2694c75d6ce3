use anyhow::Context;
use sqlx::PgPool;
use std::{
    env,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use storefront_service::config::AppConfig;
use storefront_service::gateway::SquareGateway;
use storefront_service::rewards::RewardCatalog;
use storefront_service::{build_router, AppState};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db = PgPool::connect(&database_url).await?;

    let config = AppConfig::from_env()?;
    let gateway = SquareGateway::new(&config.square)?;
    let catalog = RewardCatalog::from_env()?;
    info!(rewards = catalog.rewards().len(), "reward catalog loaded");

    let state = AppState {
        db,
        gateway: Arc::new(gateway),
        catalog: Arc::new(catalog),
        config: Arc::new(config),
    };

    let app = build_router(state);

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8090);
    let ip: IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    info!(%addr, "starting storefront-service");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
