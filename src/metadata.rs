//! Persisted per-object metadata.
//!
//! One [`FileMetadata`] instance lives next to every data file as a JSON
//! sidecar (`<data>.attr.json`) and is the source of truth for the object;
//! the in-memory index is always rebuilt from these sidecars.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default TTL applied to temporary uploads that do not name one.
pub const DEFAULT_TTL_DAYS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Active,
    Deleted,
    Expired,
    /// Set by the reconciler when the bytes on disk no longer match the
    /// recorded checksum or size. Never assigned by clients.
    Corrupt,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileStatus::Active => "active",
            FileStatus::Deleted => "deleted",
            FileStatus::Expired => "expired",
            FileStatus::Corrupt => "corrupt",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(FileStatus::Active),
            "deleted" => Ok(FileStatus::Deleted),
            "expired" => Ok(FileStatus::Expired),
            "corrupt" => Ok(FileStatus::Corrupt),
            other => Err(format!("unknown file status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    Permanent,
    Temporary,
}

impl std::fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetentionPolicy::Permanent => f.write_str("permanent"),
            RetentionPolicy::Temporary => f.write_str("temporary"),
        }
    }
}

impl std::str::FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permanent" => Ok(RetentionPolicy::Permanent),
            "temporary" => Ok(RetentionPolicy::Temporary),
            other => Err(format!("unknown retention policy: {other}")),
        }
    }
}

/// Authoritative per-object record, persisted as a JSON sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: Uuid,
    pub original_filename: String,
    pub content_type: String,
    /// On-disk path of the data file, relative to the data directory.
    pub storage_path: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the stored bytes.
    pub checksum: String,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
    pub status: FileStatus,
    pub retention_policy: RetentionPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FileMetadata {
    /// Derive `expires_at` from `uploaded_at` and a TTL in days.
    pub fn expiry_for(uploaded_at: DateTime<Utc>, ttl_days: u32) -> DateTime<Utc> {
        uploaded_at + Duration::hours(i64::from(ttl_days) * 24)
    }

    /// True when the object is temporary and its expiry has passed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.retention_policy == RetentionPolicy::Temporary
            && self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileMetadata {
        let uploaded_at = Utc::now();
        FileMetadata {
            file_id: Uuid::new_v4(),
            original_filename: "report.pdf".into(),
            content_type: "application/pdf".into(),
            storage_path: "report_alice_20260101000000_deadbeef.pdf".into(),
            size: 1024,
            checksum: "ab".repeat(32),
            uploaded_by: "alice".into(),
            uploaded_at,
            status: FileStatus::Active,
            retention_policy: RetentionPolicy::Temporary,
            ttl_days: Some(7),
            expires_at: Some(FileMetadata::expiry_for(uploaded_at, 7)),
            tags: BTreeSet::from(["reports".to_string()]),
            description: None,
        }
    }

    #[test]
    fn sidecar_roundtrip_preserves_fields() {
        let meta = sample();
        let json = serde_json::to_string(&meta).unwrap();
        let back: FileMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.file_id, meta.file_id);
        assert_eq!(back.status, FileStatus::Active);
        assert_eq!(back.expires_at, meta.expires_at);
        assert_eq!(back.tags, meta.tags);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&FileStatus::Deleted).unwrap();
        assert_eq!(json, "\"deleted\"");
        let json = serde_json::to_string(&RetentionPolicy::Permanent).unwrap();
        assert_eq!(json, "\"permanent\"");
    }

    #[test]
    fn expiry_is_ttl_days_after_upload() {
        let uploaded_at = Utc::now();
        let expires = FileMetadata::expiry_for(uploaded_at, 30);
        assert_eq!(expires - uploaded_at, Duration::hours(30 * 24));
    }

    #[test]
    fn expired_check_honors_policy() {
        let mut meta = sample();
        meta.expires_at = Some(Utc::now() - Duration::hours(1));
        assert!(meta.is_expired_at(Utc::now()));

        meta.retention_policy = RetentionPolicy::Permanent;
        assert!(!meta.is_expired_at(Utc::now()));
    }

    #[test]
    fn optional_fields_are_omitted_when_empty() {
        let mut meta = sample();
        meta.retention_policy = RetentionPolicy::Permanent;
        meta.ttl_days = None;
        meta.expires_at = None;
        meta.tags.clear();
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("ttl_days"));
        assert!(!json.contains("expires_at"));
        assert!(!json.contains("tags"));
    }
}
