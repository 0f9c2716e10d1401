use crc32fast::Hasher;
use curio_core::error::{CurioError, ErrorCode};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CurioError for BackupError {
    fn error_code(&self) -> ErrorCode {
        match self {
            BackupError::Io(_) => ErrorCode::Internal,
        }
    }
}

const FOOTER_LEN: usize = 4;

/// Point-in-time registry backups, one file per journal sequence. A backup
/// file is the serialized payload followed by a CRC-32 footer; load-time
/// validation means a half-written or bit-rotted file is skipped in favor
/// of the next older one instead of poisoning recovery. Creation prunes the
/// directory down to the newest `keep` files.
pub struct BackupStore {
    dir: PathBuf,
    keep: usize,
}

impl BackupStore {
    pub fn new(dir: impl AsRef<Path>, keep: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            keep: keep.max(1),
        }
    }

    fn file_name(seq: u64) -> String {
        format!("registry-{:016}.bak", seq)
    }

    fn parse_seq(file_name: &str) -> Option<u64> {
        file_name
            .strip_prefix("registry-")?
            .strip_suffix(".bak")?
            .parse::<u64>()
            .ok()
    }

    /// Write a backup for the given journal sequence, then prune beyond the
    /// retention count. The payload goes to a `.partial` file first and is
    /// renamed into place, so a crash never leaves a plausible-looking
    /// half backup under the real name.
    pub async fn store(&self, seq: u64, payload: &[u8]) -> Result<PathBuf, BackupError> {
        fs::create_dir_all(&self.dir).await?;

        let mut bytes = Vec::with_capacity(payload.len() + FOOTER_LEN);
        bytes.extend_from_slice(payload);
        let mut hasher = Hasher::new();
        hasher.update(payload);
        bytes.extend_from_slice(&hasher.finalize().to_le_bytes());

        let path = self.dir.join(Self::file_name(seq));
        let partial = path.with_extension("partial");
        fs::write(&partial, &bytes).await?;
        fs::rename(&partial, &path).await?;

        self.prune().await?;
        Ok(path)
    }

    /// Newest backup whose checksum verifies, as (sequence, payload).
    pub async fn latest(&self) -> Result<Option<(u64, Vec<u8>)>, BackupError> {
        let mut candidates = self.list().await?;
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (seq, path) in candidates {
            let bytes = fs::read(&path).await?;
            match validate(&bytes) {
                Some(payload) => return Ok(Some((seq, payload.to_vec()))),
                None => {
                    warn!(path = %path.display(), "skipping backup with bad checksum");
                }
            }
        }
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<(u64, PathBuf)>, BackupError> {
        if !fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(seq) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(Self::parse_seq)
            {
                out.push((seq, path));
            }
        }
        Ok(out)
    }

    async fn prune(&self) -> Result<(), BackupError> {
        let mut candidates = self.list().await?;
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, path) in candidates.into_iter().skip(self.keep) {
            if let Err(err) = fs::remove_file(&path).await {
                warn!(path = %path.display(), "could not prune old backup: {}", err);
            }
        }
        Ok(())
    }
}

fn validate(bytes: &[u8]) -> Option<&[u8]> {
    if bytes.len() < FOOTER_LEN {
        return None;
    }
    let (payload, footer) = bytes.split_at(bytes.len() - FOOTER_LEN);
    let stored = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);

    let mut hasher = Hasher::new();
    hasher.update(payload);
    (hasher.finalize() == stored).then_some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn store_and_latest_roundtrip() {
        let dir = tempdir().unwrap();
        let store = BackupStore::new(dir.path(), 3);

        store.store(4, b"state at four").await.unwrap();
        store.store(9, b"state at nine").await.unwrap();

        let (seq, payload) = store.latest().await.unwrap().unwrap();
        assert_eq!(seq, 9);
        assert_eq!(payload, b"state at nine");
    }

    #[tokio::test]
    async fn corrupt_newest_falls_back_to_older_backup() {
        let dir = tempdir().unwrap();
        let store = BackupStore::new(dir.path(), 3);

        store.store(1, b"good old state").await.unwrap();
        let newest = store.store(2, b"newest state").await.unwrap();

        // Bit-rot the newest file's payload.
        let mut bytes = fs::read(&newest).await.unwrap();
        bytes[0] ^= 0xff;
        fs::write(&newest, &bytes).await.unwrap();

        let (seq, payload) = store.latest().await.unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(payload, b"good old state");
    }

    #[tokio::test]
    async fn retention_keeps_only_the_newest_files() {
        let dir = tempdir().unwrap();
        let store = BackupStore::new(dir.path(), 2);

        for seq in 1..=5u64 {
            store.store(seq, format!("state {}", seq).as_bytes()).await.unwrap();
        }

        let mut kept: Vec<u64> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|(seq, _)| seq)
            .collect();
        kept.sort();
        assert_eq!(kept, vec![4, 5]);
    }

    #[tokio::test]
    async fn empty_or_missing_directory_yields_none() {
        let dir = tempdir().unwrap();
        let store = BackupStore::new(dir.path().join("never-created"), 2);
        assert!(store.latest().await.unwrap().is_none());
    }
}
