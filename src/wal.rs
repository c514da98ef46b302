//! Write-ahead log.
//!
//! Every file mutation runs inside a transaction journaled as one small
//! JSON file (`<transaction_id>.wal.json`) in the WAL directory. Entries
//! are published with the same write-temp, fsync, rename discipline as
//! everything else, and all mutations serialize on a single mutex so the
//! serialization, the temp file and the rename appear as one sequence.
//!
//! A `pending` entry found at startup means the process died mid-mutation:
//! recovery rolls it back and the reconciler removes any stragglers the
//! mutation left on disk.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::WalError;

const WAL_SUFFIX: &str = ".wal.json";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalOperation {
    FileCreate,
    FileUpdate,
    FileDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalStatus {
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub transaction_id: Uuid,
    pub operation: WalOperation,
    pub status: WalStatus,
    pub file_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct Wal {
    dir: PathBuf,
    // Serializes every mutation: serialize -> temp -> fsync -> rename.
    write_lock: Mutex<()>,
}

impl Wal {
    /// Open the WAL directory, creating it if needed. Failure here is
    /// fatal to startup.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, WalError> {
        let dir = dir.into();
        crate::attr_store::create_dir_restricted(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, tx_id: Uuid) -> PathBuf {
        self.dir.join(format!("{tx_id}{WAL_SUFFIX}"))
    }

    async fn persist(&self, entry: &WalEntry) -> Result<(), WalError> {
        let target = self.entry_path(entry.transaction_id);
        let mut tmp = target.as_os_str().to_owned();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let json =
            serde_json::to_vec_pretty(entry).map_err(|e| WalError::Malformed(e.to_string()))?;

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
        result.map_err(WalError::from)
    }

    async fn load(&self, tx_id: Uuid) -> Result<WalEntry, WalError> {
        let raw = match tokio::fs::read(self.entry_path(tx_id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WalError::NotFound(tx_id))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(|e| WalError::Malformed(e.to_string()))
    }

    /// Start a transaction: a fresh `pending` entry is durable before the
    /// mutation touches the data directory.
    pub async fn begin(&self, operation: WalOperation, file_id: Uuid) -> Result<WalEntry, WalError> {
        let entry = WalEntry {
            transaction_id: Uuid::new_v4(),
            operation,
            status: WalStatus::Pending,
            file_id,
            started_at: Utc::now(),
            completed_at: None,
        };
        let _guard = self.write_lock.lock().await;
        self.persist(&entry).await?;
        Ok(entry)
    }

    pub async fn commit(&self, tx_id: Uuid) -> Result<WalEntry, WalError> {
        self.finish(tx_id, WalStatus::Committed).await
    }

    pub async fn rollback(&self, tx_id: Uuid) -> Result<WalEntry, WalError> {
        self.finish(tx_id, WalStatus::RolledBack).await
    }

    async fn finish(&self, tx_id: Uuid, terminal: WalStatus) -> Result<WalEntry, WalError> {
        let _guard = self.write_lock.lock().await;
        let mut entry = self.load(tx_id).await?;
        if entry.status != WalStatus::Pending {
            return Err(WalError::NotPending(tx_id));
        }
        entry.status = terminal;
        entry.completed_at = Some(Utc::now());
        self.persist(&entry).await?;
        Ok(entry)
    }

    /// Typed read of one entry.
    pub async fn get(&self, tx_id: Uuid) -> Result<WalEntry, WalError> {
        self.load(tx_id).await
    }

    /// Scan the directory for entries whose on-disk status is `pending`.
    /// Called exactly once at startup, before traffic is accepted.
    pub async fn recover_pending(&self) -> Result<Vec<WalEntry>, WalError> {
        let mut pending = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(WAL_SUFFIX) {
                // Stale temp files from a crashed write are swept here.
                if name.ends_with(TMP_SUFFIX) {
                    let _ = tokio::fs::remove_file(&path).await;
                }
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<WalEntry>(&raw) {
                Ok(e) if e.status == WalStatus::Pending => pending.push(e),
                Ok(_) => {}
                Err(e) => warn!(wal = %path.display(), %e, "skipping malformed wal entry"),
            }
        }
        Ok(pending)
    }

    /// Roll back every pending entry found at startup. Best-effort: a
    /// failure to rewrite one entry is logged, not fatal.
    pub async fn recover(&self) -> Result<usize, WalError> {
        let pending = self.recover_pending().await?;
        let mut rolled_back = 0;
        for entry in &pending {
            match self.rollback(entry.transaction_id).await {
                Ok(_) => rolled_back += 1,
                Err(e) => warn!(
                    tx = %entry.transaction_id,
                    %e,
                    "failed to roll back pending wal entry"
                ),
            }
        }
        if rolled_back > 0 {
            info!(rolled_back, "wal recovery rolled back pending transactions");
        }
        Ok(rolled_back)
    }

    /// Remove every terminal entry; returns how many were removed.
    pub async fn clean_committed(&self) -> Result<usize, WalError> {
        let _guard = self.write_lock.lock().await;
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(WAL_SUFFIX) {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<WalEntry>(&raw) {
                Ok(e) if e.status != WalStatus::Pending => {
                    tokio::fs::remove_file(&path).await?;
                    removed += 1;
                }
                _ => {}
            }
        }
        Ok(removed)
    }
}
