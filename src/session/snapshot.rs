use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::ledger::store::sanitize_file_stem;
use crate::packer::{BoxState, PackagingPhase};
use crate::types::{ProductId, ShiftId};

pub const SNAPSHOT_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("Snapshot belongs to shift {found}, expected {expected}")]
    ShiftMismatch { expected: ShiftId, found: ShiftId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointReason {
    StateTransition,
    AfterRestore,
    BeforeShutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub checkpoint_id: String,
    pub reason: CheckpointReason,
    pub pid: Option<u32>,
    pub hostname: String,
}

impl CheckpointMetadata {
    pub fn new(reason: CheckpointReason) -> Self {
        Self {
            checkpoint_id: format!("{}_{}", Utc::now().timestamp(), rand::rng().random::<u32>()),
            reason,
            pid: Some(std::process::id()),
            hostname: hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
        }
    }
}

/// Persisted view of one shift's open box
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxSnapshot {
    pub version: String,
    pub shift_id: ShiftId,
    pub product_id: ProductId,
    pub phase: PackagingPhase,
    pub box_state: BoxState,
    pub checkpoint: CheckpointMetadata,
    pub saved_at: DateTime<Utc>,
}

impl BoxSnapshot {
    pub fn new(product_id: ProductId, phase: PackagingPhase, box_state: BoxState, reason: CheckpointReason) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            shift_id: box_state.shift_id.clone(),
            product_id,
            phase,
            box_state,
            checkpoint: CheckpointMetadata::new(reason),
            saved_at: Utc::now(),
        }
    }
}

/// Durable home of box snapshots, one per shift
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist the snapshot, replacing any previous one for the shift.
    /// Returns the checkpoint id.
    async fn save(&self, snapshot: &BoxSnapshot) -> Result<String, SnapshotError>;

    async fn load(&self, shift_id: &ShiftId) -> Result<Option<BoxSnapshot>, SnapshotError>;

    async fn delete(&self, shift_id: &ShiftId) -> Result<(), SnapshotError>;
}

/// One pretty-printed JSON file per shift, replaced atomically
pub struct FileSnapshotStore {
    directory: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn snapshot_path(&self, shift_id: &ShiftId) -> PathBuf {
        self.directory
            .join(format!("{}.box.json", sanitize_file_stem(shift_id.as_str())))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &BoxSnapshot) -> Result<String, SnapshotError> {
        fs::create_dir_all(&self.directory).await?;

        let path = self.snapshot_path(&snapshot.shift_id);
        let serialized = serde_json::to_string_pretty(snapshot)?;

        let temp_file = format!("{}.tmp", path.display());
        fs::write(&temp_file, serialized).await?;
        fs::rename(&temp_file, &path).await?;

        debug!(
            shift_id = %snapshot.shift_id,
            checkpoint_id = %snapshot.checkpoint.checkpoint_id,
            phase = %snapshot.phase,
            item_count = snapshot.box_state.item_count,
            "Box snapshot saved"
        );
        Ok(snapshot.checkpoint.checkpoint_id.clone())
    }

    async fn load(&self, shift_id: &ShiftId) -> Result<Option<BoxSnapshot>, SnapshotError> {
        let path = self.snapshot_path(shift_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: BoxSnapshot = serde_json::from_str(&contents)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                expected: SNAPSHOT_VERSION.to_string(),
                found: snapshot.version,
            });
        }
        if snapshot.shift_id != *shift_id {
            return Err(SnapshotError::ShiftMismatch {
                expected: shift_id.clone(),
                found: snapshot.shift_id,
            });
        }

        info!(
            shift_id = %shift_id,
            checkpoint_id = %snapshot.checkpoint.checkpoint_id,
            saved_at = %snapshot.saved_at,
            "Box snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    async fn delete(&self, shift_id: &ShiftId) -> Result<(), SnapshotError> {
        match fs::remove_file(self.snapshot_path(shift_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CaseCode;
    use crate::types::ReservationId;
    use tempfile::TempDir;

    fn snapshot(shift: &str) -> BoxSnapshot {
        let mut state = BoxState::new(ShiftId::new(shift), 6);
        state.reserved_case_code = Some(CaseCode::parse("149123450000000009").unwrap());
        state.reserved_case_id = Some(ReservationId::new("r-1"));
        BoxSnapshot::new(
            ProductId::new("milk-1l"),
            PackagingPhase::Accumulating,
            state,
            CheckpointReason::StateTransition,
        )
    }

    #[tokio::test]
    async fn test_save_and_load_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        let snapshot = snapshot("shift-1");

        let checkpoint_id = store.save(&snapshot).await.unwrap();
        assert_eq!(checkpoint_id, snapshot.checkpoint.checkpoint_id);

        let loaded = store.load(&ShiftId::new("shift-1")).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(!Path::new(&format!("{}.tmp", store.snapshot_path(&snapshot.shift_id).display())).exists());
    }

    #[tokio::test]
    async fn test_lookalike_shift_ids_get_separate_snapshots() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(dir.path());

        store.save(&snapshot("line/1")).await.unwrap();
        store.save(&snapshot("line_1")).await.unwrap();
        assert_ne!(
            store.snapshot_path(&ShiftId::new("line/1")),
            store.snapshot_path(&ShiftId::new("line_1"))
        );

        store.delete(&ShiftId::new("line_1")).await.unwrap();
        let kept = store.load(&ShiftId::new("line/1")).await.unwrap().unwrap();
        assert_eq!(kept.shift_id, ShiftId::new("line/1"));
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(dir.path());

        assert!(store.load(&ShiftId::new("nope")).await.unwrap().is_none());
        store.delete(&ShiftId::new("nope")).await.unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        let mut snapshot = snapshot("shift-1");
        snapshot.version = "0".to_string();
        store.save(&snapshot).await.unwrap();

        let err = store.load(&ShiftId::new("shift-1")).await.unwrap_err();
        assert!(matches!(err, SnapshotError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_delete_removes_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        store.save(&snapshot("shift-1")).await.unwrap();

        store.delete(&ShiftId::new("shift-1")).await.unwrap();
        assert!(store.load(&ShiftId::new("shift-1")).await.unwrap().is_none());
    }
}
