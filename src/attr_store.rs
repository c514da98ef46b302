//! Sidecar metadata store.
//!
//! Every data file has exactly one JSON sidecar next to it
//! (`<data>.attr.json`). Writes are capped at 4 KiB and always go through
//! write-temp, fsync, rename so a reader never observes a torn sidecar.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::errors::AttrError;
use crate::metadata::FileMetadata;

/// Suffix appended to the data-file path to form the sidecar path.
pub const ATTR_SUFFIX: &str = ".attr.json";

/// Serialized sidecars above this size must not be written. The cap keeps
/// the temp-then-rename sequence atomic without special fsync semantics
/// for large writes.
pub const MAX_ATTR_BYTES: usize = 4096;

const TMP_SUFFIX: &str = ".tmp";

/// Result of scanning a directory for sidecars.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub entries: Vec<FileMetadata>,
    /// Sidecars that failed to parse; surfaced via logs and the
    /// reconciler, never fatal to the scan.
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct AttrStore {
    data_dir: PathBuf,
}

/// `<data>.attr.json` for a given data path.
pub fn sidecar_path(data_path: &Path) -> PathBuf {
    let mut os = data_path.as_os_str().to_owned();
    os.push(ATTR_SUFFIX);
    PathBuf::from(os)
}

/// Inverse of [`sidecar_path`]; `None` when the path is not a sidecar.
pub fn data_path_of(sidecar: &Path) -> Option<PathBuf> {
    let name = sidecar.file_name()?.to_str()?;
    let stem = name.strip_suffix(ATTR_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    Some(sidecar.with_file_name(stem))
}

impl AttrStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Serialize and atomically publish the sidecar for `data_path`.
    ///
    /// Serialization is checked against [`MAX_ATTR_BYTES`] before anything
    /// touches the disk; an oversized sidecar leaves no trace.
    pub async fn write(&self, data_path: &Path, meta: &FileMetadata) -> Result<(), AttrError> {
        let json = serde_json::to_vec(meta).map_err(|e| AttrError::Malformed(e.to_string()))?;
        if json.len() > MAX_ATTR_BYTES {
            return Err(AttrError::TooLarge {
                size: json.len(),
                cap: MAX_ATTR_BYTES,
            });
        }

        if let Some(parent) = data_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                create_dir_restricted(parent).await?;
            }
        }

        let target = sidecar_path(data_path);
        let tmp = tmp_path(&target);

        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &target).await
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result.map_err(AttrError::from)
    }

    /// Full read + parse of the sidecar for `data_path`.
    pub async fn read(&self, data_path: &Path) -> Result<FileMetadata, AttrError> {
        self.read_sidecar(&sidecar_path(data_path)).await
    }

    pub async fn read_sidecar(&self, sidecar: &Path) -> Result<FileMetadata, AttrError> {
        let raw = tokio::fs::read(sidecar).await?;
        serde_json::from_slice(&raw).map_err(|e| AttrError::Malformed(e.to_string()))
    }

    /// Remove the sidecar; missing is success.
    pub async fn delete(&self, data_path: &Path) -> Result<(), AttrError> {
        match tokio::fs::remove_file(sidecar_path(data_path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, data_path: &Path) -> bool {
        tokio::fs::try_exists(sidecar_path(data_path))
            .await
            .unwrap_or(false)
    }

    /// Enumerate the immediate children of the data directory that carry
    /// the sidecar suffix, parsing each. Unparseable sidecars are counted
    /// and skipped.
    pub async fn scan(&self) -> Result<ScanOutcome, AttrError> {
        let mut outcome = ScanOutcome::default();
        let mut entries = tokio::fs::read_dir(&self.data_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(ATTR_SUFFIX) || name.ends_with(TMP_SUFFIX) {
                continue;
            }
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            match self.read_sidecar(&path).await {
                Ok(meta) => outcome.entries.push(meta),
                Err(e) => {
                    warn!(sidecar = %path.display(), %e, "skipping unparseable sidecar");
                    outcome.skipped += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Remove stale `.attr.json.tmp` leftovers after a crash.
    pub async fn sweep_temp_files(&self) -> Result<usize, AttrError> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(&format!("{ATTR_SUFFIX}{TMP_SUFFIX}")) {
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

/// `mkdir -p` with the platform's restricted directory mode (`0o750`).
#[cfg(unix)]
pub(crate) async fn create_dir_restricted(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(&dir)
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

#[cfg(not(unix))]
pub(crate) async fn create_dir_restricted(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}
