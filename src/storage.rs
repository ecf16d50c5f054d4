//! Object storage client (§6): PDFs are addressed by `storage_path` and
//! downloaded read-only; this subsystem never writes to these buckets.
//! Two backends: a local filesystem backend (dev, tests, `file://` paths)
//! and an HTTP backend (production object-storage gateway), both behind a
//! small trait so pipelines don't care which is in play.

use async_trait::async_trait;

use crate::error::PipelineError;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn download(&self, storage_path: &str) -> Result<Vec<u8>, PipelineError>;
}

/// Local filesystem backend: `storage_path` values of the form
/// `file:///abs/path` or bare paths resolved under a configured root
/// (used in tests and single-machine deployments).
pub struct FsObjectStorage {
    root: std::path::PathBuf,
}

impl FsObjectStorage {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, storage_path: &str) -> std::path::PathBuf {
        if let Some(path) = storage_path.strip_prefix("file://") {
            std::path::PathBuf::from(path)
        } else {
            self.root.join(storage_path)
        }
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn download(&self, storage_path: &str) -> Result<Vec<u8>, PipelineError> {
        let path = self.resolve(storage_path);
        tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::Storage(format!("reading {}: {e}", path.display())))
    }
}

/// HTTP-gateway backend: `storage_path` is joined onto a configured
/// bucket base URL and fetched with a plain GET (§6 buckets `index`,
/// `actes`, `plans-cadastraux`).
pub struct HttpObjectStorage {
    http: reqwest::Client,
    base_url: String,
}

impl HttpObjectStorage {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn download(&self, storage_path: &str) -> Result<Vec<u8>, PipelineError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), storage_path.trim_start_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::Storage(format!("fetching {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(PipelineError::Storage(format!("fetching {url}: status {}", response.status())));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| PipelineError::Storage(format!("reading body of {url}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fs_backend_reads_relative_path() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("doc.pdf"), b"%PDF-1.4 fake").unwrap();

        let storage = FsObjectStorage::new(dir.path());
        let bytes = storage.download("doc.pdf").await.unwrap();
        assert_eq!(bytes, b"%PDF-1.4 fake");
    }

    #[tokio::test]
    async fn fs_backend_reads_file_uri() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"%PDF-1.4 fake").unwrap();

        let storage = FsObjectStorage::new(dir.path());
        let bytes = storage.download(&format!("file://{}", path.display())).await.unwrap();
        assert_eq!(bytes, b"%PDF-1.4 fake");
    }

    #[tokio::test]
    async fn fs_backend_reports_missing_file() {
        let dir = tempdir().unwrap();
        let storage = FsObjectStorage::new(dir.path());
        assert!(storage.download("missing.pdf").await.is_err());
    }
}
