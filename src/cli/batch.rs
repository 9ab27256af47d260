use crate::batch::{submit_queued, AzureBatchClient, LinkSharing};
use crate::config::{load, Config, StoreBackend};
use crate::stage::open_stage;
use crate::storage::{open_store, RequestStore, TerminalStatus};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Opens the request store for an operator command. The memory backend is
/// refused: this process would only ever see its own empty copy.
async fn open_shared_store(
    config: &Config,
) -> Result<Arc<dyn RequestStore>, Box<dyn std::error::Error>> {
    if config.store.backend == StoreBackend::Memory {
        return Err("batch commands need a persistent request store; \
                    store.backend 'memory' only exists inside a running server \
                    (use 'duckdb' or 'table')"
            .into());
    }
    Ok(open_store(&config.store).await?)
}

/// Submits all queued requests for a deployment as one batch job.
pub async fn submit(
    config_path: Option<&Path>,
    deployment: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(config_path)?;
    let store = open_shared_store(&config).await?;
    let submitter = AzureBatchClient::new(&config.completion)?;
    let stage = open_stage(&config.stage)?;
    let sharing = LinkSharing {
        stage: stage.as_ref(),
        container: &config.stage.container,
        expiry: config.stage.sas_expiry,
    };

    match submit_queued(store.as_ref(), &submitter, deployment, Some(&sharing)).await? {
        Some(submitted) => {
            println!(
                "Submitted batch {} with {} request(s)",
                submitted.batch_id,
                submitted.request_ids.len()
            );
            for id in submitted.request_ids {
                println!("  {}", id);
            }
        }
        None => println!("No queued requests for deployment '{}'", deployment),
    }

    Ok(())
}

/// Prints a stored request as JSON.
pub async fn show(config_path: Option<&Path>, id: Uuid) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(config_path)?;
    let store = open_shared_store(&config).await?;

    let request = store.get(id).await?;
    println!("{}", serde_json::to_string_pretty(&request)?);
    Ok(())
}

/// Records the outcome of a processing request.
pub async fn finish(
    config_path: Option<&Path>,
    id: Uuid,
    status: TerminalStatus,
    result: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = result
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(|e| format!("--result is not valid JSON: {}", e))?;

    let config = load(config_path)?;
    let store = open_shared_store(&config).await?;

    store.mark_terminal(id, status, result).await?;
    info!(request_id = %id, ?status, "Request finished");
    println!("Request {} marked {}", id, crate::storage::RequestStatus::from(status));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn memory_config(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("config.yml");
        fs::write(&path, "store:\n  backend: memory\n").unwrap();
        path
    }

    #[tokio::test]
    async fn test_batch_commands_refuse_memory_store() {
        let dir = TempDir::new().unwrap();
        let path = memory_config(&dir);

        let err = submit(Some(&path), "gpt-4o").await.unwrap_err();
        assert!(err.to_string().contains("persistent request store"), "{}", err);

        let err = show(Some(&path), Uuid::new_v4()).await.unwrap_err();
        assert!(err.to_string().contains("persistent request store"));

        let err = finish(Some(&path), Uuid::new_v4(), TerminalStatus::Done, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("persistent request store"));
    }
}
