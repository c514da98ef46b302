//! Upload/download/update/delete orchestration.
//!
//! One [`StorageService`] instance wires the mode gate, the WAL, the file
//! store, the sidecar store and the index together under each request.
//! The ordering is fixed: admit, WAL begin, data file, sidecar, index,
//! WAL commit. A failure after WAL begin rolls everything back; no
//! half-visible object ever survives a failed mutation.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::attr_store::AttrStore;
use crate::config::{Config, ReplicaMode};
use crate::errors::ApiError;
use crate::file_store::FileStore;
use crate::index::{Index, ListFilter, ListPage};
use crate::metadata::{FileMetadata, FileStatus, RetentionPolicy, DEFAULT_TTL_DAYS};
use crate::metrics::Metrics;
use crate::mode::{
    save_mode_file, FileOperation, ModeFileData, ModeFsm, ModeTransition, StorageMode,
};
use crate::wal::{Wal, WalOperation};

/// Client-supplied upload attributes.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub original_filename: String,
    pub content_type: String,
    pub uploaded_by: String,
    pub retention_policy: Option<RetentionPolicy>,
    pub ttl_days: Option<u32>,
    pub tags: BTreeSet<String>,
    pub description: Option<String>,
}

/// PATCH body: absent fields stay untouched.
#[derive(Debug, Clone, Default)]
pub struct FilePatch {
    pub description: Option<String>,
    pub tags: Option<BTreeSet<String>>,
    pub status: Option<FileStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub storage_id: String,
    pub mode: StorageMode,
    pub files_total: usize,
    pub files_active: usize,
    pub files_deleted: usize,
    pub files_expired: usize,
    pub active_bytes: u64,
    pub max_capacity: u64,
    pub max_file_size: u64,
    pub disk_available: u64,
    pub disk_total: u64,
}

pub struct StorageService {
    file_store: FileStore,
    attr_store: AttrStore,
    wal: Arc<Wal>,
    index: Arc<Index>,
    fsm: Arc<ModeFsm>,
    metrics: Arc<Metrics>,
    storage_id: String,
    max_file_size: u64,
    max_capacity: u64,
    replica_mode: ReplicaMode,
    mode_file: PathBuf,
}

impl StorageService {
    pub fn new(
        config: &Config,
        file_store: FileStore,
        attr_store: AttrStore,
        wal: Arc<Wal>,
        index: Arc<Index>,
        fsm: Arc<ModeFsm>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            file_store,
            attr_store,
            wal,
            index,
            fsm,
            metrics,
            storage_id: config.storage_id.clone(),
            max_file_size: config.max_file_size,
            max_capacity: config.max_capacity,
            replica_mode: config.replica_mode,
            mode_file: config.mode_file_path(),
        }
    }

    pub fn index(&self) -> Arc<Index> {
        self.index.clone()
    }

    pub fn fsm(&self) -> Arc<ModeFsm> {
        self.fsm.clone()
    }

    pub fn file_store(&self) -> &FileStore {
        &self.file_store
    }

    pub fn attr_store(&self) -> &AttrStore {
        &self.attr_store
    }

    pub fn wal(&self) -> Arc<Wal> {
        self.wal.clone()
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    fn admit(&self, op: FileOperation) -> Result<(), ApiError> {
        let mode = self.fsm.current();
        if mode.allows(op) {
            Ok(())
        } else {
            Err(ApiError::mode_not_allowed(format!(
                "{op} is not allowed in {mode} mode"
            )))
        }
    }

    /// Retention rules: `temporary` exists only in `edit` mode (default
    /// TTL when unspecified); everything else is `permanent`.
    fn resolve_retention(
        &self,
        requested: Option<RetentionPolicy>,
        ttl_days: Option<u32>,
    ) -> Result<(RetentionPolicy, Option<u32>), ApiError> {
        let mode = self.fsm.current();
        match (mode, requested) {
            (StorageMode::Edit, Some(RetentionPolicy::Permanent)) => {
                if ttl_days.is_some() {
                    return Err(ApiError::validation(
                        "ttl_days is only valid with the temporary retention policy",
                    ));
                }
                Ok((RetentionPolicy::Permanent, None))
            }
            (StorageMode::Edit, _) => {
                let ttl = ttl_days.unwrap_or(DEFAULT_TTL_DAYS);
                if ttl == 0 {
                    return Err(ApiError::validation("ttl_days must be at least 1"));
                }
                Ok((RetentionPolicy::Temporary, Some(ttl)))
            }
            (_, Some(RetentionPolicy::Temporary)) => Err(ApiError::validation(format!(
                "temporary retention is only available in edit mode, not {mode}"
            ))),
            (_, _) => {
                if ttl_days.is_some() {
                    return Err(ApiError::validation(
                        "ttl_days is only valid with the temporary retention policy",
                    ));
                }
                Ok((RetentionPolicy::Permanent, None))
            }
        }
    }

    /// Full upload path. On any failure after the WAL entry exists the
    /// data file and sidecar are removed and the transaction rolls back.
    pub async fn upload<S, E>(
        &self,
        stream: S,
        request: UploadRequest,
    ) -> Result<FileMetadata, ApiError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        self.admit(FileOperation::Upload)?;
        let (retention_policy, ttl_days) =
            self.resolve_retention(request.retention_policy, request.ttl_days)?;

        if self.index.active_bytes().await >= self.max_capacity {
            Metrics::incr(&self.metrics.uploads_failed);
            return Err(ApiError::conflict(format!(
                "storage element {} is at capacity",
                self.storage_id
            )));
        }

        let file_id = Uuid::new_v4();
        let tx = self.wal.begin(WalOperation::FileCreate, file_id).await?;

        let stored = match self
            .file_store
            .save_file(
                stream,
                &request.original_filename,
                &request.uploaded_by,
                Some(self.max_file_size),
            )
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                Metrics::incr(&self.metrics.uploads_failed);
                self.rollback_upload(tx.transaction_id, None).await;
                return Err(e.into());
            }
        };

        let uploaded_at = Utc::now();
        let meta = FileMetadata {
            file_id,
            original_filename: request.original_filename,
            content_type: request.content_type,
            storage_path: stored.storage_path.clone(),
            size: stored.size,
            checksum: stored.checksum,
            uploaded_by: request.uploaded_by,
            uploaded_at,
            status: FileStatus::Active,
            retention_policy,
            ttl_days,
            expires_at: ttl_days.map(|ttl| FileMetadata::expiry_for(uploaded_at, ttl)),
            tags: request.tags,
            description: request.description,
        };

        if let Err(e) = self.attr_store.write(&stored.full_path, &meta).await {
            Metrics::incr(&self.metrics.uploads_failed);
            self.rollback_upload(tx.transaction_id, Some(&meta.storage_path))
                .await;
            return Err(e.into());
        }

        self.index.insert(meta.clone()).await;

        // Data and sidecar are durable; a failing commit is recoverable
        // locally and must not fail the upload.
        if let Err(e) = self.wal.commit(tx.transaction_id).await {
            error!(tx = %tx.transaction_id, %e, "wal commit failed after durable write");
        }

        Metrics::incr(&self.metrics.uploads_ok);
        Metrics::add(&self.metrics.bytes_uploaded, meta.size);
        info!(
            file_id = %meta.file_id,
            storage_path = %meta.storage_path,
            size = meta.size,
            "file uploaded"
        );
        Ok(meta)
    }

    /// Undo a partially applied upload: data file, sidecar, WAL entry.
    async fn rollback_upload(&self, tx_id: Uuid, storage_path: Option<&str>) {
        if let Some(path) = storage_path {
            if let Err(e) = self.file_store.delete(path).await {
                warn!(storage_path = path, %e, "rollback failed to remove data file");
            }
            if let Err(e) = self.attr_store.delete(&self.file_store.full_path(path)).await {
                warn!(storage_path = path, %e, "rollback failed to remove sidecar");
            }
        }
        if let Err(e) = self.wal.rollback(tx_id).await {
            warn!(tx = %tx_id, %e, "rollback failed to finalize wal entry");
        }
    }

    /// Metadata read; allowed whenever listing is.
    pub async fn get_metadata(&self, file_id: Uuid) -> Result<FileMetadata, ApiError> {
        self.admit(FileOperation::List)?;
        self.index
            .get(file_id)
            .await
            .ok_or_else(|| ApiError::not_found(format!("file {file_id} not found")))
    }

    /// Open the data file of an `active` object for streaming.
    pub async fn open_download(&self, file_id: Uuid) -> Result<(FileMetadata, tokio::fs::File), ApiError> {
        self.admit(FileOperation::Download)?;
        let meta = self.index.get(file_id).await.ok_or_else(|| {
            Metrics::incr(&self.metrics.downloads_failed);
            ApiError::not_found(format!("file {file_id} not found"))
        })?;
        if meta.status != FileStatus::Active {
            Metrics::incr(&self.metrics.downloads_failed);
            return Err(ApiError::not_found(format!(
                "file {file_id} is {} and cannot be downloaded",
                meta.status
            )));
        }
        let file = self.file_store.open_for_read(&meta.storage_path).await.map_err(|e| {
            Metrics::incr(&self.metrics.downloads_failed);
            error!(file_id = %file_id, %e, "data file missing or unreadable for active object");
            ApiError::internal("data file is unavailable")
        })?;
        Metrics::incr(&self.metrics.downloads_ok);
        Ok((meta, file))
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<ListPage, ApiError> {
        self.admit(FileOperation::List)?;
        Ok(self.index.list(filter).await)
    }

    /// Apply a PATCH: description, tags, and `active`/`deleted` status.
    pub async fn update(&self, file_id: Uuid, patch: FilePatch) -> Result<FileMetadata, ApiError> {
        self.admit(FileOperation::Update)?;
        let mut meta = self
            .index
            .get(file_id)
            .await
            .ok_or_else(|| ApiError::not_found(format!("file {file_id} not found")))?;

        if let Some(status) = patch.status {
            match status {
                FileStatus::Active | FileStatus::Deleted => {}
                other => {
                    return Err(ApiError::validation(format!(
                        "status {other} cannot be assigned by clients"
                    )))
                }
            }
            // Undelete only works while the bytes still exist; after GC
            // purged them there is nothing to bring back.
            if status == FileStatus::Active
                && meta.status != FileStatus::Active
                && !self.file_store.exists(&meta.storage_path).await
            {
                return Err(ApiError::conflict(format!(
                    "file {file_id} has no data file on disk anymore"
                )));
            }
        }

        let tx = self.wal.begin(WalOperation::FileUpdate, file_id).await?;

        if let Some(description) = patch.description {
            meta.description = if description.is_empty() {
                None
            } else {
                Some(description)
            };
        }
        if let Some(tags) = patch.tags {
            meta.tags = tags;
        }
        if let Some(status) = patch.status {
            meta.status = status;
        }

        let full_path = self.file_store.full_path(&meta.storage_path);
        if let Err(e) = self.attr_store.write(&full_path, &meta).await {
            self.finish_failed(tx.transaction_id).await;
            return Err(e.into());
        }
        self.index.update(meta.clone()).await;

        if let Err(e) = self.wal.commit(tx.transaction_id).await {
            error!(tx = %tx.transaction_id, %e, "wal commit failed after durable update");
        }
        Metrics::incr(&self.metrics.updates);
        Ok(meta)
    }

    /// Soft delete. Idempotent: deleting a deleted object succeeds. The
    /// data file stays until the GC pass removes it.
    pub async fn delete(&self, file_id: Uuid) -> Result<(), ApiError> {
        self.admit(FileOperation::Delete)?;
        let mut meta = self
            .index
            .get(file_id)
            .await
            .ok_or_else(|| ApiError::not_found(format!("file {file_id} not found")))?;

        if meta.status == FileStatus::Deleted {
            return Ok(());
        }

        let tx = self.wal.begin(WalOperation::FileDelete, file_id).await?;
        meta.status = FileStatus::Deleted;

        let full_path = self.file_store.full_path(&meta.storage_path);
        if let Err(e) = self.attr_store.write(&full_path, &meta).await {
            self.finish_failed(tx.transaction_id).await;
            return Err(e.into());
        }
        self.index.update(meta.clone()).await;

        if let Err(e) = self.wal.commit(tx.transaction_id).await {
            error!(tx = %tx.transaction_id, %e, "wal commit failed after durable delete");
        }
        Metrics::incr(&self.metrics.deletes);
        info!(file_id = %file_id, "file soft-deleted");
        Ok(())
    }

    async fn finish_failed(&self, tx_id: Uuid) {
        if let Err(e) = self.wal.rollback(tx_id).await {
            warn!(tx = %tx_id, %e, "failed to roll back wal entry");
        }
    }

    /// Guarded mode transition; the leader also republishes `mode.json`
    /// for its followers.
    pub async fn transition_mode(
        &self,
        target: StorageMode,
        confirm: bool,
        subject: &str,
    ) -> Result<ModeTransition, ApiError> {
        let record = self.fsm.transition(target, subject, confirm)?;
        Metrics::incr(&self.metrics.mode_transitions);

        if self.replica_mode == ReplicaMode::Replicated {
            let data = ModeFileData {
                mode: target,
                updated_at: record.timestamp,
                updated_by: self.storage_id.clone(),
            };
            if let Err(e) = save_mode_file(&self.mode_file, &data).await {
                // The in-memory transition already happened; followers
                // will pick the mode up on the next successful publish.
                error!(%e, "failed to publish mode file");
            }
        }
        Ok(record)
    }

    /// Totals for the storage-info endpoint.
    pub async fn storage_info(&self) -> StorageInfo {
        let (disk_available, disk_total) = disk_stats(self.file_store.data_dir());
        StorageInfo {
            storage_id: self.storage_id.clone(),
            mode: self.fsm.current(),
            files_total: self.index.len().await,
            files_active: self.index.count_by_status(FileStatus::Active).await,
            files_deleted: self.index.count_by_status(FileStatus::Deleted).await,
            files_expired: self.index.count_by_status(FileStatus::Expired).await,
            active_bytes: self.index.active_bytes().await,
            max_capacity: self.max_capacity,
            max_file_size: self.max_file_size,
            disk_available,
            disk_total,
        }
    }
}

fn disk_stats(dir: &std::path::Path) -> (u64, u64) {
    let available = fs2::available_space(dir).unwrap_or(0);
    let total = fs2::total_space(dir).unwrap_or(0);
    (available, total)
}
