//! Per-request scratch directories for the synchronous flow

use super::traits::sanitize_file_name;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// An uploaded document as received from the client.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Root under which each request gets its own private directory.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `files` into a fresh directory that is removed when the
    /// returned [`StagedBatch`] is dropped. Concurrent requests never share
    /// a directory, even when their file names collide.
    pub fn stage(&self, files: &[UploadedFile]) -> io::Result<StagedBatch> {
        std::fs::create_dir_all(&self.root)?;
        let dir = tempfile::Builder::new()
            .prefix("request-")
            .tempdir_in(&self.root)?;

        let mut paths = Vec::with_capacity(files.len());
        for (i, file) in files.iter().enumerate() {
            let path = dir
                .path()
                .join(format!("{}-{}", i, sanitize_file_name(&file.name, i)));
            std::fs::write(&path, &file.bytes)?;
            paths.push(path);
        }

        debug!(dir = %dir.path().display(), files = paths.len(), "Staged uploads");
        Ok(StagedBatch { dir, paths })
    }
}

/// Files staged for one request. Dropping it deletes the directory.
#[derive(Debug)]
pub struct StagedBatch {
    dir: TempDir,
    paths: Vec<PathBuf>,
}

impl StagedBatch {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Removes the directory now, surfacing any error instead of ignoring it.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}
