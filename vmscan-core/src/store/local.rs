use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::ObjectStore;
use crate::error::{Result, ScanError};

/// Stores objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(ScanError::Store {
                key: key.to_string(),
                reason: "key must be a relative path without '..'".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, _content_type: &str, key: &str, body: Vec<u8>) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ScanError::IoError { path: parent.to_path_buf(), source: e })?;
        }

        tokio::fs::write(&path, &body)
            .await
            .map_err(|e| ScanError::IoError { path: path.clone(), source: e })?;

        debug!(path = %path.display(), bytes = body.len(), "Wrote object");
        Ok(())
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_creates_nested_key() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        store.put("application/json", "scans/img-1/results.json", b"[]".to_vec()).await.unwrap();

        let written = std::fs::read(dir.path().join("scans/img-1/results.json")).unwrap();
        assert_eq!(written, b"[]");
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        store.put("application/json", "a.json", b"[1]".to_vec()).await.unwrap();
        store.put("application/json", "a.json", b"[]".to_vec()).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("a.json")).unwrap(), b"[]");
    }

    #[tokio::test]
    async fn test_put_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path().join("root"));

        for key in ["../outside.json", "/etc/passwd", ""] {
            let err = store.put("application/json", key, Vec::new()).await.unwrap_err();
            assert!(matches!(err, ScanError::Store { .. }), "{}: {}", key, err);
        }
    }
}
