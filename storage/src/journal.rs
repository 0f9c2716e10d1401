use crc32fast::Hasher;
use curio_core::error::{CurioError, ErrorCode};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CurioError for JournalError {
    fn error_code(&self) -> ErrorCode {
        match self {
            JournalError::Io(_) => ErrorCode::Internal,
        }
    }
}

/// Frame layout, little-endian:
/// `[magic u8][payload_len u32][seq u64][crc u32][payload]`
/// where the checksum covers the sequence number and the payload together,
/// so a frame spliced from two writes cannot verify.
const FRAME_MAGIC: u8 = 0xC9;
const FRAME_HEADER_LEN: usize = 1 + 4 + 8 + 4;

/// Append-only journal shared by the registry, vector, and graph stores.
/// Each store keeps its own file, so a crash between cross-store writes
/// leaves the others untouched and retryable.
///
/// Recovery happens entirely at open: the file is scanned once, every frame
/// that checks out is handed back to the caller, and anything after the
/// first bad frame is treated as a torn tail and truncated. Sequence
/// numbers continue from the last recovered frame, so they stay monotonic
/// across restarts.
pub struct Journal {
    file: File,
    path: PathBuf,
    next_seq: u64,
}

impl Journal {
    /// Open (or create) a journal and return the surviving frames in order.
    pub async fn open(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(u64, Vec<u8>)>), JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(JournalError::Io(err)),
        };

        let (frames, valid_len) = scan_frames(&bytes);
        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                dropped = bytes.len() - valid_len,
                "truncating torn journal tail"
            );
            let trunc = OpenOptions::new().write(true).open(&path).await?;
            trunc.set_len(valid_len as u64).await?;
            trunc.sync_all().await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let next_seq = frames.last().map(|(seq, _)| seq + 1).unwrap_or(1);

        Ok((
            Self {
                file,
                path,
                next_seq,
            },
            frames,
        ))
    }

    /// Append one frame. The whole frame goes out in a single write so the
    /// header and payload can only tear together, which the scanner then
    /// drops as one unit.
    pub async fn append(&mut self, payload: &[u8]) -> Result<u64, JournalError> {
        let seq = self.next_seq;

        let mut hasher = Hasher::new();
        hasher.update(&seq.to_le_bytes());
        hasher.update(payload);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.push(FRAME_MAGIC);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&seq.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(payload);

        self.file.write_all(&frame).await?;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Durability point: callers append the frames of one transaction, then
    /// commit once.
    pub async fn commit(&mut self) -> Result<(), JournalError> {
        self.file.sync_data().await?;
        Ok(())
    }

    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Walk the buffer frame by frame. Returns the decoded frames and the byte
/// length of the valid prefix; scanning stops at the first frame that is
/// short, mis-tagged, or fails its checksum.
fn scan_frames(bytes: &[u8]) -> (Vec<(u64, Vec<u8>)>, usize) {
    let mut frames = Vec::new();
    let mut pos = 0usize;

    while bytes.len() - pos >= FRAME_HEADER_LEN {
        if bytes[pos] != FRAME_MAGIC {
            break;
        }
        let len = u32::from_le_bytes([
            bytes[pos + 1],
            bytes[pos + 2],
            bytes[pos + 3],
            bytes[pos + 4],
        ]) as usize;
        let seq = u64::from_le_bytes([
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
            bytes[pos + 8],
            bytes[pos + 9],
            bytes[pos + 10],
            bytes[pos + 11],
            bytes[pos + 12],
        ]);
        let crc = u32::from_le_bytes([
            bytes[pos + 13],
            bytes[pos + 14],
            bytes[pos + 15],
            bytes[pos + 16],
        ]);

        let payload_start = pos + FRAME_HEADER_LEN;
        let Some(payload) = bytes.get(payload_start..payload_start + len) else {
            break; // frame runs past the end of the file
        };

        let mut hasher = Hasher::new();
        hasher.update(&seq.to_le_bytes());
        hasher.update(payload);
        if hasher.finalize() != crc {
            break;
        }

        frames.push((seq, payload.to_vec()));
        pos = payload_start + len;
    }

    (frames, pos)
}
