pub mod azure_blob;
pub mod local;
pub mod staging;
pub mod traits;

pub use azure_blob::AzureBlobStage;
pub use local::LocalObjectStage;
pub use staging::{StagedBatch, StagingArea, UploadedFile};
pub use traits::{
    sanitize_file_name, validate_object_name, ObjectStage, StageError, StagedObject,
    UploadOutcome,
};

use crate::config::{StageBackend, StageConfig};
use std::sync::Arc;
use tracing::info;

/// Builds the configured object stage backend.
pub fn open_stage(config: &StageConfig) -> Result<Arc<dyn ObjectStage>, StageError> {
    match config.backend {
        StageBackend::Azure => {
            info!("Using Azure Blob Storage object stage");
            Ok(Arc::new(AzureBlobStage::from_config(config)?))
        }
        StageBackend::Local => Ok(Arc::new(LocalObjectStage::new(config.local_root.clone()))),
    }
}
