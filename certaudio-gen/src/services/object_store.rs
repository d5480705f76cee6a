//! Object storage for episode artifacts
//!
//! `put` overwrites idempotently; writes go through a temp file and a rename
//! so a reader never sees a half-written object.

use crate::error::ExternalError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes at `path` and return their URL
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<String, ExternalError>;

    /// Remove every object under `prefix`
    async fn delete(&self, prefix: &str) -> Result<(), ExternalError>;
}

/// Filesystem-backed store rooted at a directory
pub struct LocalObjectStore {
    root: PathBuf,
    /// Public base URL; `file://` URLs are returned when unset
    base_url: Option<String>,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf, base_url: Option<String>) -> Self {
        Self {
            root,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ExternalError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || path.trim().is_empty() {
            return Err(ExternalError::Permanent(format!(
                "Invalid object path: {}",
                path
            )));
        }
        Ok(self.root.join(relative))
    }

    fn url_for(&self, path: &str, full: &Path) -> String {
        match &self.base_url {
            Some(base) => format!("{}/{}", base, path.trim_start_matches('/')),
            None => format!("file://{}", full.display()),
        }
    }
}

fn io_error(context: &str, err: std::io::Error) -> ExternalError {
    ExternalError::Transient(format!("{}: {}", context, err))
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, ExternalError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create object directory", e))?;
        }

        let mut tmp = full.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error("write object", e))?;
        tokio::fs::rename(&tmp, &full)
            .await
            .map_err(|e| io_error("publish object", e))?;

        tracing::debug!(path, content_type, bytes = bytes.len(), "Stored object");
        Ok(self.url_for(path, &full))
    }

    async fn delete(&self, prefix: &str) -> Result<(), ExternalError> {
        let full = self.resolve(prefix)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&full)
                .await
                .map_err(|e| io_error("delete prefix", e)),
            Ok(_) => tokio::fs::remove_file(&full)
                .await
                .map_err(|e| io_error("delete object", e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("stat prefix", e)),
        }
    }
}
