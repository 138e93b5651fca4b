//! Wires configuration, storage, queues and the HTTP server together.

use crate::api::{self, AppState};
use crate::config::ServerConfig;
use crate::db::{PgExecutionStore, PgJobRecordStore, PgWorkflowSource};
use crate::error::ServerError;
use crate::workers::{self, Transport};
use genweave_provider::{HttpPredictionClient, LocalOutputStorage, OpenAiTextGenerator};
use genweave_queue::QueueClient;
use genweave_workflow::{CompletionMode, Engine, EngineDeps};
use rootcause::prelude::Report;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Runs the server until Ctrl-C, then lets in-flight work wind down.
///
/// # Errors
///
/// Returns an error if any startup step fails or the listener dies.
pub async fn run(config: ServerConfig) -> Result<(), Report<ServerError>> {
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .map_err(|e| ServerError::Database {
            details: e.to_string(),
        })?;

    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .map_err(|e| ServerError::Migration {
            details: e.to_string(),
        })?;

    let transport = Transport::connect(config.nats.as_ref())
        .await
        .map_err(|e| ServerError::Queue {
            details: e.to_string(),
        })?;
    let queue = QueueClient::new(
        transport.job_queue(),
        Arc::new(PgJobRecordStore::new(db_pool.clone())),
    );

    let predictions = Arc::new(HttpPredictionClient::new(config.provider.clone()).map_err(
        |e| ServerError::Provider {
            details: e.to_string(),
        },
    )?);
    let text = Arc::new(OpenAiTextGenerator::new(config.text.clone()).map_err(|e| {
        ServerError::Provider {
            details: e.to_string(),
        }
    })?);
    let storage = Arc::new(LocalOutputStorage::new(
        &config.storage.output_dir,
        &config.storage.public_base_url,
    ));

    let engine_config = config.engine_config();
    if engine_config.completion_mode == CompletionMode::Webhook
        && config.provider.webhook_url.is_none()
    {
        warn!("completion mode is webhook but no provider webhook URL is configured");
    }

    let store = Arc::new(PgExecutionStore::new(db_pool.clone()));
    let workflows = Arc::new(PgWorkflowSource::new(db_pool));
    let engine = Arc::new(Engine::new(EngineDeps {
        store: store.clone(),
        workflows: workflows.clone(),
        queue,
        predictions: predictions.clone(),
        text,
        storage,
        config: engine_config,
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = workers::spawn(
        &engine,
        &transport,
        &config.queues,
        config.recovery.clone(),
        &shutdown_rx,
    );

    let app = api::with_outputs(
        api::router(AppState {
            engine,
            store,
            workflows,
            predictions,
        }),
        &config.storage,
    );

    let listener = tokio::net::TcpListener::bind(&config.http.bind_address)
        .await
        .map_err(|e| ServerError::Bind {
            address: config.http.bind_address.clone(),
            details: e.to_string(),
        })?;
    info!("listening on http://{}", config.http.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| ServerError::Serve {
            details: e.to_string(),
        })?;

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "worker task ended abnormally");
        }
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutdown signal received");
    shutdown.send_replace(true);
}
