use std::{env, error::Error, net::SocketAddr};

use observability_sdk::{config::TelemetryConfig, setup, user_service};
use tokio::net::TcpListener;

const SERVICE_NAME: &str = "user-service";
const DEFAULT_PORT: u16 = 8001;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let mut config = TelemetryConfig::from_env()?;
    if env::var_os("SERVICE_NAME").is_none() {
        config.service_name = SERVICE_NAME.to_string();
    }
    let port = match env::var("PORT") {
        Ok(port) => port.parse()?,
        Err(_) => DEFAULT_PORT,
    };

    let telemetry = setup::setup(&config)?;
    let app = user_service::router(&telemetry);

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    tracing::info!(address = %listener.local_addr()?, "Starting {}", config.service_name);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("server stopped");
    telemetry.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
