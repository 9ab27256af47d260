use async_trait::async_trait;
use futures::future::join_all;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("object {container}/{name} not found")]
    NotFound { container: String, name: String },

    #[error("invalid object name '{0}'")]
    InvalidName(String),

    #[error("object storage unavailable: {0}")]
    Unavailable(#[from] reqwest::Error),

    #[error("object storage returned error status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("object storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object storage configuration: {0}")]
    Config(#[from] ConfigError),
}

/// One item handed to [`ObjectStage::put_many`].
#[derive(Debug, Clone)]
pub struct StagedObject {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Per-item result of [`ObjectStage::put_many`].
#[derive(Debug)]
pub struct UploadOutcome {
    pub name: String,
    pub result: Result<String, StageError>,
}

impl UploadOutcome {
    pub fn locator(&self) -> Option<&str> {
        self.result.as_deref().ok()
    }
}

/// Durable storage for uploaded documents.
#[async_trait]
pub trait ObjectStage: Send + Sync {
    /// Stores `bytes` as `container/name`, creating the container if needed,
    /// and returns a locator for the stored object.
    async fn put(&self, container: &str, bytes: Vec<u8>, name: &str) -> Result<String, StageError>;

    /// Uploads every item concurrently. A failing item never aborts the
    /// others; outcomes come back in input order.
    async fn put_many(&self, container: &str, items: Vec<StagedObject>) -> Vec<UploadOutcome> {
        let uploads = items.into_iter().map(|item| async move {
            let result = self.put(container, item.bytes, &item.name).await;
            if let Err(e) = &result {
                tracing::error!(container, name = %item.name, error = %e, "Upload failed");
            }
            UploadOutcome {
                name: item.name,
                result,
            }
        });

        join_all(uploads).await
    }

    async fn get(&self, container: &str, name: &str) -> Result<Vec<u8>, StageError>;

    async fn delete(&self, container: &str, name: &str) -> Result<(), StageError>;

    /// Names of the objects in `container`, optionally only those starting
    /// with `prefix`.
    async fn list(&self, container: &str, prefix: Option<&str>) -> Result<Vec<String>, StageError>;

    /// A URL granting read access to `container/name` until `expiry` has
    /// passed, for handing stored documents to an outside service.
    fn sas_url(&self, container: &str, name: &str, expiry: Duration) -> Result<String, StageError>;

    /// The object name behind a locator returned by `put` into `container`,
    /// or `None` if the locator does not belong to it.
    fn object_name(&self, container: &str, locator: &str) -> Option<String>;
}

/// Rejects names that could escape the container (`..`, absolute paths,
/// backslashes) or are empty.
pub fn validate_object_name(name: &str) -> Result<(), StageError> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");

    if bad {
        Err(StageError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Reduces an uploaded file name to a single safe path segment.
pub fn sanitize_file_name(raw: &str, index: usize) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("").trim();

    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        format!("document-{}", index)
    } else {
        cleaned
    }
}
