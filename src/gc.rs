//! Expiry-driven garbage collection. Leader only.
//!
//! Each pass streams the data directory once. Temporary objects past
//! their expiry flip to `expired` in the sidecar, lose their data file and
//! are updated in the index; already-`deleted` objects that still have a
//! data file lose it too. The sidecars of expired and deleted objects are
//! kept as the audit record of the object.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::attr_store::{data_path_of, AttrStore, ATTR_SUFFIX};
use crate::errors::StoreError;
use crate::file_store::FileStore;
use crate::index::Index;
use crate::metadata::FileStatus;
use crate::metrics::Metrics;
use crate::wal::Wal;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GcPassSummary {
    /// Sidecars examined in this pass.
    pub examined: u64,
    /// Active temporary objects flipped to `expired`.
    pub expired: u64,
    /// Data files removed (for both freshly expired and already deleted
    /// objects).
    pub purged: u64,
    /// Terminal WAL entries compacted away.
    pub wal_compacted: u64,
}

pub struct Gc {
    file_store: FileStore,
    attr_store: AttrStore,
    wal: Arc<Wal>,
    index: Arc<Index>,
    metrics: Arc<Metrics>,
    interval: Duration,
}

impl Gc {
    pub fn new(
        file_store: FileStore,
        attr_store: AttrStore,
        wal: Arc<Wal>,
        index: Arc<Index>,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> Self {
        Self {
            file_store,
            attr_store,
            wal,
            index,
            metrics,
            interval,
        }
    }

    /// One bounded pass over the data directory. Entries stream through;
    /// nothing is materialized up front.
    pub async fn run_pass(&self) -> Result<GcPassSummary, StoreError> {
        let now = Utc::now();
        let mut summary = GcPassSummary::default();

        let mut entries = tokio::fs::read_dir(self.attr_store.data_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(ATTR_SUFFIX) {
                continue;
            }
            let Some(data_path) = data_path_of(&path) else {
                continue;
            };
            let mut meta = match self.attr_store.read_sidecar(&path).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(sidecar = %path.display(), %e, "gc skipping unparseable sidecar");
                    continue;
                }
            };
            summary.examined += 1;

            match meta.status {
                FileStatus::Active if meta.is_expired_at(now) => {
                    meta.status = FileStatus::Expired;
                    if let Err(e) = self.attr_store.write(&data_path, &meta).await {
                        warn!(file_id = %meta.file_id, %e, "gc failed to mark sidecar expired");
                        continue;
                    }
                    if let Err(e) = self.file_store.delete(&meta.storage_path).await {
                        warn!(file_id = %meta.file_id, %e, "gc failed to remove expired data file");
                    } else {
                        summary.purged += 1;
                    }
                    self.index.update(meta.clone()).await;
                    summary.expired += 1;
                    info!(file_id = %meta.file_id, expired_at = ?meta.expires_at, "object expired");
                }
                FileStatus::Deleted => {
                    if self.file_store.exists(&meta.storage_path).await {
                        if let Err(e) = self.file_store.delete(&meta.storage_path).await {
                            warn!(file_id = %meta.file_id, %e, "gc failed to remove deleted data file");
                        } else {
                            summary.purged += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        match self.wal.clean_committed().await {
            Ok(cleaned) => summary.wal_compacted = cleaned as u64,
            Err(e) => warn!(%e, "gc failed to compact terminal wal entries"),
        }

        Metrics::incr(&self.metrics.gc_passes);
        Metrics::add(&self.metrics.gc_expired, summary.expired);
        Metrics::add(&self.metrics.gc_purged, summary.purged);
        Ok(summary)
    }

    /// Periodic driver, owned by the leader. Cancelling stops the loop
    /// between passes.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("gc loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.run_pass().await {
                        Ok(summary) if summary.expired > 0 || summary.purged > 0 => {
                            info!(
                                examined = summary.examined,
                                expired = summary.expired,
                                purged = summary.purged,
                                "gc pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(%e, "gc pass failed"),
                    }
                }
            }
        }
    }
}
