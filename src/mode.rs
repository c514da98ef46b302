//! Storage-mode lifecycle and operation admission.
//!
//! A node is always in exactly one of four modes. `edit` is an isolated
//! commissioning mode with no transitions in or out; the production
//! lifecycle is `rw -> ro -> ar`, with `ro -> rw` as the only reverse edge
//! and only with an explicit confirmation flag. In replicated deployments
//! the leader publishes the mode as `mode.json` on the shared filesystem
//! and followers adopt it on their refresh tick.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::errors::ModeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    Edit,
    Rw,
    Ro,
    Ar,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StorageMode::Edit => "edit",
            StorageMode::Rw => "rw",
            StorageMode::Ro => "ro",
            StorageMode::Ar => "ar",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "edit" => Ok(StorageMode::Edit),
            "rw" => Ok(StorageMode::Rw),
            "ro" => Ok(StorageMode::Ro),
            "ar" => Ok(StorageMode::Ar),
            other => Err(format!("unknown storage mode: {other}")),
        }
    }
}

/// Operations gated by the mode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Upload,
    Download,
    Delete,
    Update,
    List,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileOperation::Upload => "upload",
            FileOperation::Download => "download",
            FileOperation::Delete => "delete",
            FileOperation::Update => "update",
            FileOperation::List => "list",
        };
        f.write_str(s)
    }
}

impl StorageMode {
    /// Admission table: which operations are legal in this mode.
    pub fn allows(self, op: FileOperation) -> bool {
        match self {
            StorageMode::Edit => true,
            StorageMode::Rw => !matches!(op, FileOperation::Delete),
            StorageMode::Ro => matches!(op, FileOperation::Download | FileOperation::List),
            StorageMode::Ar => matches!(op, FileOperation::List),
        }
    }
}

/// One applied transition, kept in the in-memory history.
#[derive(Debug, Clone, Serialize)]
pub struct ModeTransition {
    pub from: StorageMode,
    pub to: StorageMode,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
}

struct FsmInner {
    current: StorageMode,
    history: Vec<ModeTransition>,
}

/// Mode state machine. All reads and transitions go through one lock so
/// concurrent callers always observe a consistent snapshot.
pub struct ModeFsm {
    inner: Mutex<FsmInner>,
}

impl ModeFsm {
    pub fn new(initial: StorageMode) -> Self {
        Self {
            inner: Mutex::new(FsmInner {
                current: initial,
                history: Vec::new(),
            }),
        }
    }

    pub fn current(&self) -> StorageMode {
        self.inner.lock().expect("mode lock poisoned").current
    }

    pub fn can_perform(&self, op: FileOperation) -> bool {
        self.current().allows(op)
    }

    pub fn history(&self) -> Vec<ModeTransition> {
        self.inner.lock().expect("mode lock poisoned").history.clone()
    }

    /// Apply a guarded transition. `confirmed` is only consulted for the
    /// `ro -> rw` reverse edge.
    pub fn transition(
        &self,
        to: StorageMode,
        subject: &str,
        confirmed: bool,
    ) -> Result<ModeTransition, ModeError> {
        let mut inner = self.inner.lock().expect("mode lock poisoned");
        let from = inner.current;

        let allowed = matches!(
            (from, to),
            (StorageMode::Rw, StorageMode::Ro)
                | (StorageMode::Ro, StorageMode::Ar)
                | (StorageMode::Ro, StorageMode::Rw)
        );
        if !allowed {
            return Err(ModeError::InvalidTransition { from, to });
        }
        if from == StorageMode::Ro && to == StorageMode::Rw && !confirmed {
            return Err(ModeError::ConfirmationRequired { from, to });
        }

        let record = ModeTransition {
            from,
            to,
            subject: subject.to_string(),
            timestamp: Utc::now(),
        };
        inner.current = to;
        inner.history.push(record.clone());
        info!(%from, %to, subject, "storage mode changed");
        Ok(record)
    }

    /// Adopt a mode without running the transition guard. Used only by the
    /// follower refresh loop to mirror the leader's published mode.
    pub fn force_mode(&self, to: StorageMode, subject: &str) -> Option<ModeTransition> {
        let mut inner = self.inner.lock().expect("mode lock poisoned");
        let from = inner.current;
        if from == to {
            return None;
        }
        let record = ModeTransition {
            from,
            to,
            subject: subject.to_string(),
            timestamp: Utc::now(),
        };
        inner.current = to;
        inner.history.push(record.clone());
        info!(%from, %to, subject, "storage mode adopted");
        Some(record)
    }
}

/// Shared `mode.json` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeFileData {
    pub mode: StorageMode,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

/// Atomically replace `mode.json` (temp file, fsync, rename).
pub async fn save_mode_file(path: &Path, data: &ModeFileData) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await
}

/// Read and validate `mode.json`. `Ok(None)` when the file does not exist.
pub async fn load_mode_file(path: &Path) -> std::io::Result<Option<ModeFileData>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let data = serde_json::from_slice(&raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn admission_table_matches_contract() {
        use FileOperation::*;

        let cases = [
            (StorageMode::Edit, Upload, true),
            (StorageMode::Edit, Delete, true),
            (StorageMode::Rw, Upload, true),
            (StorageMode::Rw, Delete, false),
            (StorageMode::Rw, Update, true),
            (StorageMode::Ro, Upload, false),
            (StorageMode::Ro, Download, true),
            (StorageMode::Ro, Update, false),
            (StorageMode::Ar, Download, false),
            (StorageMode::Ar, List, true),
        ];
        for (mode, op, expected) in cases {
            assert_eq!(mode.allows(op), expected, "{mode} / {op}");
        }
    }

    #[test]
    fn lifecycle_transitions() {
        let fsm = ModeFsm::new(StorageMode::Rw);
        fsm.transition(StorageMode::Ro, "admin", false).unwrap();
        assert_eq!(fsm.current(), StorageMode::Ro);
        fsm.transition(StorageMode::Ar, "admin", false).unwrap();
        assert_eq!(fsm.current(), StorageMode::Ar);
        assert_eq!(fsm.history().len(), 2);
    }

    #[test]
    fn ar_is_terminal() {
        let fsm = ModeFsm::new(StorageMode::Ar);
        for target in [StorageMode::Rw, StorageMode::Ro, StorageMode::Edit] {
            let err = fsm.transition(target, "admin", true).unwrap_err();
            assert!(matches!(err, ModeError::InvalidTransition { .. }));
        }
    }

    #[test]
    fn edit_is_isolated() {
        let fsm = ModeFsm::new(StorageMode::Edit);
        for target in [StorageMode::Rw, StorageMode::Ro, StorageMode::Ar] {
            assert!(fsm.transition(target, "admin", true).is_err());
        }

        let fsm = ModeFsm::new(StorageMode::Rw);
        assert!(fsm.transition(StorageMode::Edit, "admin", true).is_err());
    }

    #[test]
    fn ro_skip_is_rejected() {
        let fsm = ModeFsm::new(StorageMode::Rw);
        let err = fsm.transition(StorageMode::Ar, "admin", true).unwrap_err();
        assert!(matches!(err, ModeError::InvalidTransition { .. }));
    }

    #[test]
    fn reverse_edge_requires_confirmation() {
        let fsm = ModeFsm::new(StorageMode::Ro);
        let err = fsm.transition(StorageMode::Rw, "admin", false).unwrap_err();
        assert_eq!(
            err,
            ModeError::ConfirmationRequired {
                from: StorageMode::Ro,
                to: StorageMode::Rw,
            }
        );
        fsm.transition(StorageMode::Rw, "admin", true).unwrap();
        assert_eq!(fsm.current(), StorageMode::Rw);
    }

    #[test]
    fn force_mode_bypasses_guard() {
        let fsm = ModeFsm::new(StorageMode::Rw);
        let record = fsm.force_mode(StorageMode::Ar, "refresh").unwrap();
        assert_eq!(record.to, StorageMode::Ar);
        assert_eq!(fsm.current(), StorageMode::Ar);
        // Adopting the current mode is a no-op.
        assert!(fsm.force_mode(StorageMode::Ar, "refresh").is_none());
    }

    #[tokio::test]
    async fn mode_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mode.json");

        assert!(load_mode_file(&path).await.unwrap().is_none());

        let data = ModeFileData {
            mode: StorageMode::Ro,
            updated_at: Utc::now(),
            updated_by: "se-1".into(),
        };
        save_mode_file(&path, &data).await.unwrap();

        let loaded = load_mode_file(&path).await.unwrap().unwrap();
        assert_eq!(loaded.mode, StorageMode::Ro);
        assert_eq!(loaded.updated_by, "se-1");

        // No temp residue next to the mode file.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["mode.json".to_string()]);
    }
}
