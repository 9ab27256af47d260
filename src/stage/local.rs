//! Local file system object stage

use super::traits::{validate_object_name, ObjectStage, StageError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

/// Stores objects as files under `<root>/<container>/<name>`.
/// Locators have the form `<container>/<name>`.
#[derive(Debug, Clone)]
pub struct LocalObjectStage {
    root: PathBuf,
}

impl LocalObjectStage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        info!("Local object stage rooted at: {}", root.display());
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, container: &str, name: &str) -> Result<PathBuf, StageError> {
        validate_object_name(container)?;
        if container.contains('/') {
            return Err(StageError::InvalidName(container.to_string()));
        }
        validate_object_name(name)?;
        Ok(self.root.join(container).join(name))
    }

    fn not_found(container: &str, name: &str) -> StageError {
        StageError::NotFound {
            container: container.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStage for LocalObjectStage {
    async fn put(&self, container: &str, bytes: Vec<u8>, name: &str) -> Result<String, StageError> {
        let path = self.object_path(container, name)?;

        // Creates the container directory on first use, and any
        // intermediate directories the name implies.
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &bytes).await?;

        debug!(container, name, size = bytes.len(), "Stored object");
        Ok(format!("{}/{}", container, name))
    }

    async fn get(&self, container: &str, name: &str) -> Result<Vec<u8>, StageError> {
        let path = self.object_path(container, name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Self::not_found(container, name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, container: &str, name: &str) -> Result<(), StageError> {
        let path = self.object_path(container, name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(container, name, "Deleted object");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Self::not_found(container, name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, container: &str, prefix: Option<&str>) -> Result<Vec<String>, StageError> {
        validate_object_name(container)?;
        let base = self.root.join(container);
        if !fs::try_exists(&base).await? {
            return Err(Self::not_found(container, ""));
        }

        let mut names = Vec::new();
        let mut pending = vec![(base, String::new())];
        while let Some((dir, relative)) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let name = if relative.is_empty() {
                    file_name
                } else {
                    format!("{}/{}", relative, file_name)
                };

                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), name));
                } else if prefix.map_or(true, |p| name.starts_with(p)) {
                    names.push(name);
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Local objects need no signature; the locator is returned as is.
    fn sas_url(&self, container: &str, name: &str, _expiry: Duration) -> Result<String, StageError> {
        self.object_path(container, name)?;
        Ok(format!("{}/{}", container, name))
    }

    fn object_name(&self, container: &str, locator: &str) -> Option<String> {
        let name = locator.strip_prefix(container)?.strip_prefix('/')?;
        validate_object_name(name).ok()?;
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::traits::StagedObject;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_creates_container_and_get_returns_bytes() {
        let dir = TempDir::new().unwrap();
        let stage = LocalObjectStage::new(dir.path());

        let locator = stage
            .put("documents", b"hello".to_vec(), "abc/scan.pdf")
            .await
            .unwrap();
        assert_eq!(locator, "documents/abc/scan.pdf");
        assert!(dir.path().join("documents/abc/scan.pdf").exists());

        let bytes = stage.get("documents", "abc/scan.pdf").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let stage = LocalObjectStage::new(dir.path());
        assert!(matches!(
            stage.get("documents", "nope.pdf").await,
            Err(StageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let stage = LocalObjectStage::new(dir.path());
        stage.put("documents", vec![1, 2, 3], "a.bin").await.unwrap();

        stage.delete("documents", "a.bin").await.unwrap();
        assert!(matches!(
            stage.delete("documents", "a.bin").await,
            Err(StageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_traversal_is_rejected() {
        let dir = TempDir::new().unwrap();
        let stage = LocalObjectStage::new(dir.path().join("objects"));
        assert!(matches!(
            stage.put("documents", vec![], "../escape").await,
            Err(StageError::InvalidName(_))
        ));
        assert!(matches!(
            stage.put("../documents", vec![], "a").await,
            Err(StageError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_put_many_keeps_going_after_failure() {
        let dir = TempDir::new().unwrap();
        let stage = LocalObjectStage::new(dir.path());

        let outcomes = stage
            .put_many(
                "documents",
                vec![
                    StagedObject { name: "a.txt".to_string(), bytes: b"a".to_vec() },
                    StagedObject { name: "../bad".to_string(), bytes: b"b".to_vec() },
                    StagedObject { name: "c.txt".to_string(), bytes: b"c".to_vec() },
                ],
            )
            .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].locator(), Some("documents/a.txt"));
        assert!(outcomes[1].result.is_err());
        assert_eq!(outcomes[2].locator(), Some("documents/c.txt"));
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let dir = TempDir::new().unwrap();
        let stage = LocalObjectStage::new(dir.path());
        for name in ["req1/0/a.png", "req1/1/b.png", "req2/0/c.png"] {
            stage.put("documents", vec![0], name).await.unwrap();
        }

        assert_eq!(
            stage.list("documents", Some("req1/")).await.unwrap(),
            vec!["req1/0/a.png", "req1/1/b.png"]
        );
        assert_eq!(stage.list("documents", None).await.unwrap().len(), 3);
        assert!(matches!(
            stage.list("missing", None).await,
            Err(StageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_locator_maps_back_to_name() {
        let dir = TempDir::new().unwrap();
        let stage = LocalObjectStage::new(dir.path());
        let locator = stage.put("documents", vec![0], "r/0/a.png").await.unwrap();

        assert_eq!(stage.object_name("documents", &locator).as_deref(), Some("r/0/a.png"));
        assert_eq!(stage.object_name("other", &locator), None);
        assert_eq!(
            stage.sas_url("documents", "r/0/a.png", Duration::from_secs(60)).unwrap(),
            locator
        );
    }
}
