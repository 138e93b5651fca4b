use genweave_server::config::ServerConfig;
use genweave_server::error::ServerError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            let err = ServerError::Config {
                details: e.to_string(),
            };
            tracing::error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    tracing::info!("Loaded configuration");

    if let Err(report) = genweave_server::startup::run(config).await {
        tracing::error!(error = %report, "server failed");
        std::process::exit(1);
    }
}
