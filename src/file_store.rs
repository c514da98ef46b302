//! Data-file store.
//!
//! Streams upload bytes to a sibling temp file while hashing them, fsyncs,
//! then atomically renames into place. A reader can never observe a
//! partial data file; failed writes leave nothing behind but a temp file
//! that the startup sweep or the reconciler removes.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::StoreError;

const TMP_SUFFIX: &str = ".tmp";
const READ_CHUNK: usize = 64 * 1024;

/// Result of persisting one upload.
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Path relative to the data directory.
    pub storage_path: String,
    pub full_path: PathBuf,
    pub size: u64,
    /// Lowercase hex SHA-256 of the persisted bytes.
    pub checksum: String,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn full_path(&self, storage_path: &str) -> PathBuf {
        self.data_dir.join(storage_path)
    }

    /// Stream `stream` to disk under a freshly derived storage name.
    ///
    /// The bytes fan out to two sinks while they arrive: the temp file and
    /// a SHA-256 hasher. Exceeding `max_bytes` aborts the write. On any
    /// failure the temp file is removed best-effort and the error
    /// propagates untouched.
    pub async fn save_file<S, E>(
        &self,
        mut stream: S,
        original_filename: &str,
        uploaded_by: &str,
        max_bytes: Option<u64>,
    ) -> Result<StoredFile, StoreError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let storage_path = derive_storage_name(original_filename, uploaded_by);
        let full_path = self.full_path(&storage_path);
        let tmp = tmp_path(&full_path);

        let mut file = File::create(&tmp).await?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;

        let result: Result<(), StoreError> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| StoreError::Stream(e.to_string()))?;
                size += chunk.len() as u64;
                if let Some(limit) = max_bytes {
                    if size > limit {
                        return Err(StoreError::MaxSizeExceeded { limit });
                    }
                }
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
            }
            file.sync_all().await?;
            Ok(())
        }
        .await;

        drop(file);
        if let Err(e) = result {
            if let Err(rm) = tokio::fs::remove_file(&tmp).await {
                warn!(tmp = %tmp.display(), %rm, "failed to remove temp file after aborted write");
            }
            return Err(e);
        }

        tokio::fs::rename(&tmp, &full_path).await.map_err(|e| {
            // Rename failed after a durable temp write; nothing was
            // published, so drop the temp and surface the error.
            let tmp = tmp.clone();
            tokio::spawn(async move {
                let _ = tokio::fs::remove_file(&tmp).await;
            });
            StoreError::Io(e)
        })?;

        let checksum = hex::encode(hasher.finalize());
        debug!(storage_path, size, checksum, "data file published");

        Ok(StoredFile {
            storage_path,
            full_path,
            size,
            checksum,
        })
    }

    pub async fn open_for_read(&self, storage_path: &str) -> Result<File, StoreError> {
        Ok(File::open(self.full_path(storage_path)).await?)
    }

    /// Remove the data file; a missing file is success.
    pub async fn delete(&self, storage_path: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.full_path(storage_path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, storage_path: &str) -> bool {
        tokio::fs::try_exists(self.full_path(storage_path))
            .await
            .unwrap_or(false)
    }

    pub async fn size(&self, storage_path: &str) -> Result<u64, StoreError> {
        Ok(tokio::fs::metadata(self.full_path(storage_path)).await?.len())
    }

    /// Recompute the SHA-256 of the stored bytes with a full streaming
    /// re-read.
    pub async fn compute_checksum(&self, storage_path: &str) -> Result<String, StoreError> {
        let mut file = self.open_for_read(storage_path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Remove stale `*.tmp` leftovers from a crashed write.
    pub async fn sweep_temp_files(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(TMP_SUFFIX)
                && entry.file_type().await.map(|t| t.is_file()).unwrap_or(false)
            {
                let _ = tokio::fs::remove_file(&path).await;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_owned();
    os.push(TMP_SUFFIX);
    PathBuf::from(os)
}

const NAME_MAX: usize = 50;
const USER_MAX: usize = 20;
const EXT_MAX: usize = 16;

/// `sanitize(name)_sanitize(user)_YYYYMMDDhhmmss_<8hex>[.ext]`
fn derive_storage_name(original_filename: &str, uploaded_by: &str) -> String {
    let (stem, ext) = split_extension(original_filename);
    let name = sanitize_component(stem, NAME_MAX);
    let user = sanitize_component(uploaded_by, USER_MAX);
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let nonce = &Uuid::new_v4().simple().to_string()[..8];

    let mut out = format!("{name}_{user}_{stamp}_{nonce}");
    if let Some(ext) = ext {
        let ext = sanitize_component(ext, EXT_MAX);
        if ext != "file" {
            out.push('.');
            out.push_str(&ext);
        }
    }
    out
}

fn split_extension(filename: &str) -> (&str, Option<&str>) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (filename, None),
    }
}

/// Keep `[A-Za-z0-9_-]` and Cyrillic letters, drop everything else, then
/// truncate. An empty result falls back to `file`.
fn sanitize_component(raw: &str, max_chars: usize) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric()
                || *c == '_'
                || *c == '-'
                || ('\u{0400}'..='\u{04FF}').contains(c)
        })
        .take(max_chars)
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}
