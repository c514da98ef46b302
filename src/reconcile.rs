//! Disk / sidecar / index consistency sweep. Leader only.
//!
//! One walk over the data directory classifies every object into the
//! drift categories and heals what is safe to heal. Findings never reach
//! request handlers; each run produces a machine-readable report for the
//! maintenance endpoint.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::attr_store::{data_path_of, sidecar_path, AttrStore, ATTR_SUFFIX};
use crate::errors::StoreError;
use crate::file_store::FileStore;
use crate::index::Index;
use crate::metadata::FileStatus;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Sidecars examined.
    pub scanned: u64,
    /// Data files with no sidecar. Recorded, never auto-deleted.
    pub orphan_data_files: u64,
    /// Active sidecars whose data file is gone; flipped to `deleted`.
    pub orphan_sidecars: u64,
    /// Recomputed SHA-256 disagreed with the sidecar.
    pub checksum_mismatches: u64,
    /// On-disk length disagreed with the sidecar.
    pub size_mismatches: u64,
    /// Sidecars that failed to parse.
    pub unparseable_sidecars: u64,
}

pub struct Reconciler {
    file_store: FileStore,
    attr_store: AttrStore,
    index: Arc<Index>,
    metrics: Arc<Metrics>,
    interval: Duration,
    last_report: RwLock<Option<ReconcileReport>>,
}

impl Reconciler {
    pub fn new(
        file_store: FileStore,
        attr_store: AttrStore,
        index: Arc<Index>,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            file_store,
            attr_store,
            index,
            metrics,
            interval,
            last_report: RwLock::new(None),
        })
    }

    pub async fn last_report(&self) -> Option<ReconcileReport> {
        self.last_report.read().await.clone()
    }

    /// One full sweep. Also invoked on demand by the maintenance
    /// endpoint.
    pub async fn run_once(&self) -> Result<ReconcileReport, StoreError> {
        let started = Instant::now();
        let mut report = ReconcileReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        // Single walk: collect sidecar-backed names, then look at data
        // files that had no sidecar.
        let mut claimed_data: HashSet<String> = HashSet::new();
        let mut data_files: Vec<String> = Vec::new();

        let mut entries = tokio::fs::read_dir(self.attr_store.data_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if name == crate::election::LOCK_FILE
                || name == crate::election::INFO_FILE
                || name == "mode.json"
                || name.ends_with(".tmp")
            {
                continue;
            }

            if name.ends_with(ATTR_SUFFIX) {
                report.scanned += 1;
                let Some(data_path) = data_path_of(&path) else {
                    continue;
                };
                let mut meta = match self.attr_store.read_sidecar(&path).await {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!(sidecar = %path.display(), %e, "reconcile: unparseable sidecar");
                        report.unparseable_sidecars += 1;
                        continue;
                    }
                };
                claimed_data.insert(meta.storage_path.clone());

                let data_exists = self.file_store.exists(&meta.storage_path).await;
                if !data_exists {
                    if meta.status == FileStatus::Active {
                        // Orphan sidecar: the bytes are gone, so the
                        // object is gone.
                        meta.status = FileStatus::Deleted;
                        if let Err(e) = self.attr_store.write(&data_path, &meta).await {
                            warn!(file_id = %meta.file_id, %e, "reconcile: failed to mark orphan sidecar deleted");
                        }
                        self.index.remove(meta.file_id).await;
                        report.orphan_sidecars += 1;
                        warn!(file_id = %meta.file_id, storage_path = %meta.storage_path,
                              "reconcile: active sidecar without data file, marked deleted");
                    }
                    continue;
                }

                if meta.status != FileStatus::Active {
                    continue;
                }

                let drift = self.check_drift(&meta).await;
                match drift {
                    Ok(DriftCheck::Clean) => {}
                    Ok(DriftCheck::SizeMismatch { actual }) => {
                        report.size_mismatches += 1;
                        error!(file_id = %meta.file_id, expected = meta.size, actual,
                               "reconcile: data file size drifted, marking corrupt");
                        self.mark_corrupt(&data_path, meta).await;
                    }
                    Ok(DriftCheck::ChecksumMismatch { actual }) => {
                        report.checksum_mismatches += 1;
                        error!(file_id = %meta.file_id, expected = %meta.checksum, actual = %actual,
                               "reconcile: data file checksum drifted, marking corrupt");
                        self.mark_corrupt(&data_path, meta).await;
                    }
                    Err(e) => {
                        warn!(file_id = %meta.file_id, %e, "reconcile: drift check failed");
                    }
                }
            } else {
                data_files.push(name.to_string());
            }
        }

        for name in data_files {
            if !claimed_data.contains(&name) {
                let full = self.file_store.full_path(&name);
                if !tokio::fs::try_exists(sidecar_path(&full)).await.unwrap_or(false) {
                    report.orphan_data_files += 1;
                    warn!(storage_path = %name, "reconcile: data file without sidecar");
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;

        Metrics::incr(&self.metrics.reconcile_runs);
        Metrics::add(&self.metrics.orphan_data_files, report.orphan_data_files);
        Metrics::add(&self.metrics.orphan_sidecars, report.orphan_sidecars);
        Metrics::add(
            &self.metrics.corrupt_objects,
            report.checksum_mismatches + report.size_mismatches,
        );

        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    async fn check_drift(
        &self,
        meta: &crate::metadata::FileMetadata,
    ) -> Result<DriftCheck, StoreError> {
        let actual_size = self.file_store.size(&meta.storage_path).await?;
        if actual_size != meta.size {
            return Ok(DriftCheck::SizeMismatch {
                actual: actual_size,
            });
        }
        let actual = self.file_store.compute_checksum(&meta.storage_path).await?;
        if actual != meta.checksum {
            return Ok(DriftCheck::ChecksumMismatch { actual });
        }
        Ok(DriftCheck::Clean)
    }

    /// Flip the sidecar to `corrupt` and evict the object from lookups.
    /// The data file stays on disk for operator inspection.
    async fn mark_corrupt(&self, data_path: &std::path::Path, mut meta: crate::metadata::FileMetadata) {
        meta.status = FileStatus::Corrupt;
        if let Err(e) = self.attr_store.write(data_path, &meta).await {
            warn!(file_id = %meta.file_id, %e, "reconcile: failed to persist corrupt marker");
        }
        self.index.remove(meta.file_id).await;
    }

    /// Periodic driver, owned by the leader.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reconcile loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) => {
                            info!(
                                scanned = report.scanned,
                                orphan_data = report.orphan_data_files,
                                orphan_sidecars = report.orphan_sidecars,
                                checksum_mismatches = report.checksum_mismatches,
                                size_mismatches = report.size_mismatches,
                                duration_ms = report.duration_ms,
                                "reconcile pass complete"
                            );
                        }
                        Err(e) => warn!(%e, "reconcile pass failed"),
                    }
                }
            }
        }
    }
}

enum DriftCheck {
    Clean,
    SizeMismatch { actual: u64 },
    ChecksumMismatch { actual: String },
}
