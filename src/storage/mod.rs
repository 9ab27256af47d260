pub mod azure_table;
pub mod duckdb;
pub mod memory;
pub mod traits;

use std::sync::Arc;

use crate::config::{StoreBackend, StoreConfig};

pub use self::duckdb::DuckDbRequestStore;
pub use azure_table::TableRequestStore;
pub use memory::MemoryRequestStore;
pub use traits::{
    BatchRequest, NewBatchRequest, RequestStatus, RequestStore, StoreError, TerminalStatus,
};

/// Opens the configured backend and makes sure its schema exists.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn RequestStore>, StoreError> {
    let store: Arc<dyn RequestStore> = match config.backend {
        StoreBackend::DuckDb => {
            if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!(
                        "failed to create database directory '{}': {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            tracing::info!(path = %config.path.display(), table = %config.table_name, "Opening DuckDB request store");
            Arc::new(DuckDbRequestStore::new(&config.path, &config.table_name)?)
        }
        StoreBackend::Table => {
            tracing::info!(table = %config.table_name, "Using Azure Table Storage request store");
            Arc::new(TableRequestStore::from_config(config)?)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory request store; queued requests are lost on restart");
            Arc::new(MemoryRequestStore::new())
        }
    };

    store.init_schema().await?;
    Ok(store)
}
