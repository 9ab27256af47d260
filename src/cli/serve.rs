use crate::clients::{AzureOpenAiClient, CompletionError, DocumentIntelligenceClient, ExtractionError};
use crate::config::{load, Config, ConfigError};
use crate::stage::{open_stage, StageError, StagingArea};
use crate::storage::{open_store, StoreError};
use crate::web::{run_server, AppState};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("request store error: {0}")]
    Store(#[from] StoreError),

    #[error("object stage error: {0}")]
    Stage(#[from] StageError),

    #[error("extraction client error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("completion client error: {0}")]
    Completion(#[from] CompletionError),

    #[error("web server error: {0}")]
    WebServer(#[from] std::io::Error),
}

/// Wires every component from `config` into the shared handler state.
pub async fn build_state(config: &Config) -> Result<AppState, RunError> {
    let store = open_store(&config.store).await?;

    let stage = open_stage(&config.stage)?;
    let extractor = Arc::new(DocumentIntelligenceClient::new(&config.extraction)?);
    let completion = Arc::new(AzureOpenAiClient::new(&config.completion)?);

    info!(dir = %config.staging.dir.display(), "Staging directory configured");
    let staging = Arc::new(StagingArea::new(config.staging.dir.clone()));

    Ok(AppState {
        store,
        stage,
        extractor,
        completion,
        staging,
        container: config.stage.container.clone(),
    })
}

pub async fn run(config_path: Option<&Path>) -> Result<(), RunError> {
    let config = load(config_path)?;
    let state = build_state(&config).await?;

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl-C, initiating shutdown");
    };

    run_server(
        state,
        &config.web.listen,
        config.web.max_upload_bytes,
        shutdown,
    )
    .await?;

    info!("Shutdown complete");
    Ok(())
}
