//! In-memory metadata index.
//!
//! Process-local mirror of the sidecar store, rebuilt from disk on startup
//! and on every follower refresh tick. Readers share the lock; writers are
//! infrequent (one per mutation). Listing returns a snapshot ordered by
//! upload time, newest first.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::attr_store::AttrStore;
use crate::errors::AttrError;
use crate::metadata::{FileMetadata, FileStatus};

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<FileStatus>,
    pub tag: Option<String>,
    pub uploaded_by: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct ListPage {
    pub entries: Vec<FileMetadata>,
    /// Total matches before limit/offset were applied.
    pub total: usize,
}

#[derive(Default)]
pub struct Index {
    map: RwLock<HashMap<Uuid, FileMetadata>>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the sidecars on disk, replacing any previous state.
    /// Corrupt objects stay out of the index entirely; their sidecar on
    /// disk is the operator's record. Returns how many sidecars failed to
    /// parse.
    pub async fn build_from_store(&self, attrs: &AttrStore) -> Result<usize, AttrError> {
        let outcome = attrs.scan().await?;
        let mut fresh = HashMap::with_capacity(outcome.entries.len());
        for meta in outcome.entries {
            if meta.status == FileStatus::Corrupt {
                continue;
            }
            fresh.insert(meta.file_id, meta);
        }
        let count = fresh.len();
        *self.map.write().await = fresh;
        debug!(entries = count, skipped = outcome.skipped, "index rebuilt");
        Ok(outcome.skipped)
    }

    pub async fn insert(&self, meta: FileMetadata) {
        self.map.write().await.insert(meta.file_id, meta);
    }

    pub async fn update(&self, meta: FileMetadata) {
        self.map.write().await.insert(meta.file_id, meta);
    }

    pub async fn remove(&self, file_id: Uuid) -> Option<FileMetadata> {
        self.map.write().await.remove(&file_id)
    }

    pub async fn get(&self, file_id: Uuid) -> Option<FileMetadata> {
        self.map.read().await.get(&file_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }

    pub async fn count_by_status(&self, status: FileStatus) -> usize {
        self.map
            .read()
            .await
            .values()
            .filter(|m| m.status == status)
            .count()
    }

    /// Sum of data-file sizes for `active` objects.
    pub async fn active_bytes(&self) -> u64 {
        self.map
            .read()
            .await
            .values()
            .filter(|m| m.status == FileStatus::Active)
            .map(|m| m.size)
            .sum()
    }

    /// Snapshot listing.
    pub async fn list(&self, filter: &ListFilter) -> ListPage {
        let map = self.map.read().await;
        let mut matches: Vec<&FileMetadata> = map
            .values()
            .filter(|m| filter.status.map(|status| m.status == status).unwrap_or(true))
            .filter(|m| {
                filter
                    .tag
                    .as_ref()
                    .map(|t| m.tags.contains(t))
                    .unwrap_or(true)
            })
            .filter(|m| {
                filter
                    .uploaded_by
                    .as_ref()
                    .map(|u| &m.uploaded_by == u)
                    .unwrap_or(true)
            })
            .collect();

        matches.sort_by(|a, b| {
            b.uploaded_at
                .cmp(&a.uploaded_at)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });

        let total = matches.len();
        let entries = matches
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        ListPage { entries, total }
    }

    /// Snapshot of every entry, for the maintenance sweeps.
    pub async fn snapshot(&self) -> Vec<FileMetadata> {
        self.map.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RetentionPolicy;
    use chrono::{Duration, Utc};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn meta(name: &str, status: FileStatus, age_mins: i64) -> FileMetadata {
        FileMetadata {
            file_id: Uuid::new_v4(),
            original_filename: name.into(),
            content_type: "application/octet-stream".into(),
            storage_path: name.into(),
            size: 10,
            checksum: "cd".repeat(32),
            uploaded_by: "tester".into(),
            uploaded_at: Utc::now() - Duration::minutes(age_mins),
            status,
            retention_policy: RetentionPolicy::Permanent,
            ttl_days: None,
            expires_at: None,
            tags: BTreeSet::new(),
            description: None,
        }
    }

    #[tokio::test]
    async fn point_lookups_and_counts() {
        let index = Index::new();
        let a = meta("a.bin", FileStatus::Active, 1);
        let d = meta("d.bin", FileStatus::Deleted, 2);
        index.insert(a.clone()).await;
        index.insert(d.clone()).await;

        assert_eq!(index.len().await, 2);
        assert_eq!(index.count_by_status(FileStatus::Active).await, 1);
        assert_eq!(index.get(a.file_id).await.unwrap().file_id, a.file_id);

        index.remove(d.file_id).await.unwrap();
        assert!(index.get(d.file_id).await.is_none());
    }

    #[tokio::test]
    async fn list_orders_newest_first_and_paginates() {
        let index = Index::new();
        for age in 0..5 {
            index.insert(meta(&format!("f{age}"), FileStatus::Active, age)).await;
        }

        let page = index
            .list(&ListFilter {
                limit: Some(2),
                offset: 1,
                ..Default::default()
            })
            .await;
        assert_eq!(page.total, 5);
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].original_filename, "f1");
        assert_eq!(page.entries[1].original_filename, "f2");
    }

    #[tokio::test]
    async fn list_filters_by_status_tag_and_uploader() {
        let index = Index::new();
        let mut tagged = meta("tagged.bin", FileStatus::Active, 0);
        tagged.tags.insert("reports".into());
        tagged.uploaded_by = "alice".into();
        index.insert(tagged).await;
        index.insert(meta("plain.bin", FileStatus::Deleted, 1)).await;

        let page = index
            .list(&ListFilter {
                status: Some(FileStatus::Deleted),
                ..Default::default()
            })
            .await;
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].original_filename, "plain.bin");

        let page = index
            .list(&ListFilter {
                tag: Some("reports".into()),
                uploaded_by: Some("alice".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].original_filename, "tagged.bin");
    }

    #[tokio::test]
    async fn corrupt_sidecars_are_not_indexed_on_rebuild() {
        let dir = TempDir::new().unwrap();
        let attrs = AttrStore::new(dir.path());
        let index = Index::new();

        let good = meta("ok.bin", FileStatus::Active, 0);
        let bad = meta("bad.bin", FileStatus::Corrupt, 1);
        attrs.write(&dir.path().join("ok.bin"), &good).await.unwrap();
        attrs.write(&dir.path().join("bad.bin"), &bad).await.unwrap();

        index.build_from_store(&attrs).await.unwrap();
        assert_eq!(index.len().await, 1);
        assert!(index.get(good.file_id).await.is_some());
        assert!(index.get(bad.file_id).await.is_none());
    }

    #[tokio::test]
    async fn rebuild_replaces_previous_state() {
        let dir = TempDir::new().unwrap();
        let attrs = AttrStore::new(dir.path());
        let index = Index::new();

        // Something stale that the rebuild must drop.
        index.insert(meta("stale.bin", FileStatus::Active, 0)).await;

        let on_disk = meta("disk.bin", FileStatus::Active, 0);
        attrs
            .write(&dir.path().join("disk.bin"), &on_disk)
            .await
            .unwrap();
        std::fs::write(dir.path().join("junk.bin.attr.json"), b"not json").unwrap();

        let skipped = index.build_from_store(&attrs).await.unwrap();
        assert_eq!(skipped, 1);
        assert_eq!(index.len().await, 1);
        assert!(index.get(on_disk.file_id).await.is_some());
    }

    #[tokio::test]
    async fn active_bytes_ignores_non_active() {
        let index = Index::new();
        index.insert(meta("a.bin", FileStatus::Active, 0)).await;
        index.insert(meta("b.bin", FileStatus::Deleted, 0)).await;
        assert_eq!(index.active_bytes().await, 10);
    }
}
