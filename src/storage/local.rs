use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::{ObjectStore, StorageError};

/// Stores objects under a directory on the local filesystem.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !safe {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &bytes).await?;
        debug!("Stored {} bytes at {:?}", bytes.len(), target);
        Ok(path.to_string())
    }
}
