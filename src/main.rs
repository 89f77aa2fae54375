use std::sync::Arc;

use sparrow_rides::{
    handlers,
    state::{AppConfig, AppState},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let level = std::env::var("SPARROW_LOG")
        .ok()
        .and_then(|raw| raw.parse::<tracing::Level>().ok())
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = AppConfig::from_env()?;
    let bind_addr = config.bind_addr.clone();
    let app_state = Arc::new(AppState::new(config).await?);
    let workers = app_state.start_workers().await;
    tracing::info!("Started {} background workers", workers.len());

    let app = handlers::router(app_state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Listening on {}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
