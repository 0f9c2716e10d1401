use curio_core::error::{CurioError, ErrorCode};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob not found: {0}")]
    NotFound(String),
}

impl CurioError for BlobError {
    fn error_code(&self) -> ErrorCode {
        match self {
            BlobError::Io(_) => ErrorCode::Internal,
            BlobError::NotFound(_) => ErrorCode::NotFound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Original,
    Thumb,
}

impl BlobKind {
    fn file_name(&self) -> &'static str {
        match self {
            BlobKind::Original => "original",
            BlobKind::Thumb => "thumb",
        }
    }
}

/// Filesystem object store. Layout: `<container>/<doc>/original|thumb` plus
/// `exports/<artifact>.tar`; existence of the original is implied by an
/// active document, orphans are swept in the background.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, BlobError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        fs::create_dir_all(root.join("uploads")).await?;
        fs::create_dir_all(root.join("exports")).await?;
        Ok(Self { root })
    }

    fn document_dir(&self, container_id: &str, document_id: &str) -> PathBuf {
        self.root.join(container_id).join(document_id)
    }

    pub fn key(container_id: &str, document_id: &str, kind: BlobKind) -> String {
        format!("{}/{}/{}", container_id, document_id, kind.file_name())
    }

    pub async fn put(
        &self,
        container_id: &str,
        document_id: &str,
        kind: BlobKind,
        bytes: &[u8],
    ) -> Result<String, BlobError> {
        let dir = self.document_dir(container_id, document_id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(kind.file_name()), bytes).await?;
        Ok(Self::key(container_id, document_id, kind))
    }

    pub async fn get(
        &self,
        container_id: &str,
        document_id: &str,
        kind: BlobKind,
    ) -> Result<Vec<u8>, BlobError> {
        let path = self.document_dir(container_id, document_id).join(kind.file_name());
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound(
                Self::key(container_id, document_id, kind),
            )),
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    pub async fn exists(&self, container_id: &str, document_id: &str, kind: BlobKind) -> bool {
        fs::try_exists(self.document_dir(container_id, document_id).join(kind.file_name()))
            .await
            .unwrap_or(false)
    }

    pub async fn delete_document(
        &self,
        container_id: &str,
        document_id: &str,
    ) -> Result<(), BlobError> {
        let dir = self.document_dir(container_id, document_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    pub async fn delete_container(&self, container_id: &str) -> Result<(), BlobError> {
        let dir = self.root.join(container_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    /// Staging area for file-token uploads referenced by ingest sources.
    pub async fn put_upload(&self, token: &str, bytes: &[u8]) -> Result<(), BlobError> {
        fs::write(self.root.join("uploads").join(token), bytes).await?;
        Ok(())
    }

    pub async fn get_upload(&self, token: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.root.join("uploads").join(token);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(format!("uploads/{}", token)))
            }
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    pub async fn put_export(&self, artifact_id: &str, bytes: &[u8]) -> Result<String, BlobError> {
        let key = format!("exports/{}.tar", artifact_id);
        fs::write(self.root.join(&key), bytes).await?;
        Ok(key)
    }

    pub async fn get_export(&self, artifact_id: &str) -> Result<Vec<u8>, BlobError> {
        let key = format!("exports/{}.tar", artifact_id);
        match fs::read(self.root.join(&key)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(key))
            }
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    /// Remove document directories no active document refers to. Returns the
    /// number of directories removed.
    pub async fn sweep_orphans(
        &self,
        container_id: &str,
        known_document_ids: &HashSet<String>,
    ) -> Result<usize, BlobError> {
        let container_dir = self.root.join(container_id);
        if !fs::try_exists(&container_dir).await.unwrap_or(false) {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = fs::read_dir(&container_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            if !known_document_ids.contains(&name) {
                warn!(container_id, document_id = %name, "sweeping orphaned blob");
                fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn is_writable(&self) -> bool {
        let probe = self.root.join(".probe");
        let ok = fs::write(&probe, b"ok").await.is_ok();
        let _ = fs::remove_file(&probe).await;
        ok
    }
}
