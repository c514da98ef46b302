//! Follower-side refresh loop.
//!
//! Followers never mutate the data directory themselves; every tick they
//! rebuild the index from the sidecars the leader wrote and adopt the
//! leader's published mode. Runs once immediately on start, then on the
//! configured interval.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::attr_store::AttrStore;
use crate::index::Index;
use crate::metrics::Metrics;
use crate::mode::{load_mode_file, ModeFsm};

pub struct RefreshLoop {
    attr_store: AttrStore,
    index: Arc<Index>,
    fsm: Arc<ModeFsm>,
    mode_file: PathBuf,
    metrics: Arc<Metrics>,
    interval: Duration,
}

impl RefreshLoop {
    pub fn new(
        attr_store: AttrStore,
        index: Arc<Index>,
        fsm: Arc<ModeFsm>,
        mode_file: PathBuf,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> Self {
        Self {
            attr_store,
            index,
            fsm,
            mode_file,
            metrics,
            interval,
        }
    }

    /// One refresh tick: index rebuild, then mode adoption.
    pub async fn refresh_once(&self) {
        match self.index.build_from_store(&self.attr_store).await {
            Ok(skipped) if skipped > 0 => {
                warn!(skipped, "index refresh skipped unparseable sidecars");
            }
            Ok(_) => {}
            Err(e) => warn!(%e, "index refresh failed"),
        }
        Metrics::incr(&self.metrics.index_refreshes);

        match load_mode_file(&self.mode_file).await {
            Ok(Some(data)) => {
                if let Some(change) = self.fsm.force_mode(data.mode, &data.updated_by) {
                    info!(
                        from = %change.from,
                        to = %change.to,
                        published_by = %data.updated_by,
                        "adopted leader mode"
                    );
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%e, "failed to load shared mode file"),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        self.refresh_once().await;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately and was just done
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("refresh loop stopped");
                    return;
                }
                _ = ticker.tick() => self.refresh_once().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FileMetadata, FileStatus, RetentionPolicy};
    use crate::mode::{save_mode_file, ModeFileData, StorageMode};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn meta(name: &str) -> FileMetadata {
        FileMetadata {
            file_id: Uuid::new_v4(),
            original_filename: name.into(),
            content_type: "application/octet-stream".into(),
            storage_path: name.into(),
            size: 1,
            checksum: "ef".repeat(32),
            uploaded_by: "leader".into(),
            uploaded_at: Utc::now(),
            status: FileStatus::Active,
            retention_policy: RetentionPolicy::Permanent,
            ttl_days: None,
            expires_at: None,
            tags: BTreeSet::new(),
            description: None,
        }
    }

    fn refresh_over(dir: &TempDir, index: Arc<Index>, fsm: Arc<ModeFsm>) -> RefreshLoop {
        RefreshLoop::new(
            AttrStore::new(dir.path()),
            index,
            fsm,
            dir.path().join("mode.json"),
            Arc::new(Metrics::default()),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn tick_rebuilds_index_and_adopts_mode() {
        let dir = TempDir::new().unwrap();
        let attrs = AttrStore::new(dir.path());
        let index = Arc::new(Index::new());
        let fsm = Arc::new(ModeFsm::new(StorageMode::Rw));

        // The leader wrote an object and flipped the cluster read-only.
        let published = meta("from-leader.bin");
        attrs
            .write(&dir.path().join("from-leader.bin"), &published)
            .await
            .unwrap();
        save_mode_file(
            &dir.path().join("mode.json"),
            &ModeFileData {
                mode: StorageMode::Ro,
                updated_at: Utc::now(),
                updated_by: "se-leader".into(),
            },
        )
        .await
        .unwrap();

        let refresh = refresh_over(&dir, index.clone(), fsm.clone());
        refresh.refresh_once().await;

        assert!(index.get(published.file_id).await.is_some());
        assert_eq!(fsm.current(), StorageMode::Ro);
    }

    #[tokio::test]
    async fn missing_mode_file_keeps_current_mode() {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(Index::new());
        let fsm = Arc::new(ModeFsm::new(StorageMode::Rw));

        let refresh = refresh_over(&dir, index, fsm.clone());
        refresh.refresh_once().await;
        assert_eq!(fsm.current(), StorageMode::Rw);
    }

    #[tokio::test]
    async fn loop_is_cancellable() {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(Index::new());
        let fsm = Arc::new(ModeFsm::new(StorageMode::Rw));

        let refresh = refresh_over(&dir, index, fsm);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(refresh.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refresh loop must stop promptly")
            .unwrap();
    }
}
