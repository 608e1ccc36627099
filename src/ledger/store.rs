use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use super::LedgerIoError;
use crate::codec::{CaseCode, UnitCode};
use crate::types::{ProductId, ShiftId};

/// Context stored alongside every durable scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanMetadata {
    pub product_id: Option<ProductId>,
    /// Case the unit was packed into at scan time, if packaging
    pub case_code: Option<CaseCode>,
    /// Box generation at scan time; see `BoxState::box_epoch`
    pub box_epoch: u64,
    pub station_id: Option<String>,
}

/// One durable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedScan {
    pub shift_id: ShiftId,
    pub unit: UnitCode,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: ScanMetadata,
}

/// Durable backing store for the scan ledger
///
/// The ledger owns the merge and dedup policy; implementations only store
/// and return entries. Keys passed to `delete_scans` are `UnitCode::dedup_key`
/// values.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn persist_scan(
        &self,
        shift_id: &ShiftId,
        unit: &UnitCode,
        metadata: &ScanMetadata,
    ) -> Result<(), LedgerIoError>;

    async fn query_persisted_scans(&self, shift_id: &ShiftId) -> Result<Vec<PersistedScan>, LedgerIoError>;

    async fn contains(&self, shift_id: &ShiftId, dedup_key: &str) -> Result<bool, LedgerIoError>;

    async fn delete_scans(&self, shift_id: &ShiftId, dedup_keys: &[String]) -> Result<usize, LedgerIoError>;

    async fn clear_shift(&self, shift_id: &ShiftId) -> Result<(), LedgerIoError>;
}

/// Process-local store, used for tests and ephemeral stations
#[derive(Debug, Default)]
pub struct MemoryScanStore {
    scans: RwLock<HashMap<ShiftId, Vec<PersistedScan>>>,
}

impl MemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, shift_id: &ShiftId) -> usize {
        self.scans.read().await.get(shift_id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl ScanStore for MemoryScanStore {
    async fn persist_scan(
        &self,
        shift_id: &ShiftId,
        unit: &UnitCode,
        metadata: &ScanMetadata,
    ) -> Result<(), LedgerIoError> {
        self.scans
            .write()
            .await
            .entry(shift_id.clone())
            .or_default()
            .push(PersistedScan {
                shift_id: shift_id.clone(),
                unit: unit.clone(),
                timestamp: Utc::now(),
                metadata: metadata.clone(),
            });
        Ok(())
    }

    async fn query_persisted_scans(&self, shift_id: &ShiftId) -> Result<Vec<PersistedScan>, LedgerIoError> {
        Ok(self.scans.read().await.get(shift_id).cloned().unwrap_or_default())
    }

    async fn contains(&self, shift_id: &ShiftId, dedup_key: &str) -> Result<bool, LedgerIoError> {
        Ok(self
            .scans
            .read()
            .await
            .get(shift_id)
            .is_some_and(|scans| scans.iter().any(|s| s.unit.dedup_key() == dedup_key)))
    }

    async fn delete_scans(&self, shift_id: &ShiftId, dedup_keys: &[String]) -> Result<usize, LedgerIoError> {
        let mut scans = self.scans.write().await;
        let Some(entries) = scans.get_mut(shift_id) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|s| !dedup_keys.contains(&s.unit.dedup_key()));
        Ok(before - entries.len())
    }

    async fn clear_shift(&self, shift_id: &ShiftId) -> Result<(), LedgerIoError> {
        self.scans.write().await.remove(shift_id);
        Ok(())
    }
}

/// Append-only JSON-lines store, one file per shift
///
/// Appends are flushed and synced before `persist_scan` returns. Deletions
/// rewrite the file through a temporary file and a rename. Lines that fail to
/// parse (a torn write from a crash) are skipped with a warning.
///
/// Dedup keys are indexed per shift on first use; the station lock guarantees
/// this process is the only writer of the directory.
#[derive(Debug)]
pub struct JsonlScanStore {
    directory: PathBuf,
    write_lock: Mutex<()>,
    key_index: RwLock<HashMap<ShiftId, HashSet<String>>>,
}

impl JsonlScanStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            write_lock: Mutex::new(()),
            key_index: RwLock::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File backing one shift
    pub fn shift_file_path(&self, shift_id: &ShiftId) -> PathBuf {
        self.directory
            .join(format!("{}.scans.jsonl", sanitize_file_stem(shift_id.as_str())))
    }

    /// Entries recorded for `shift_id`
    async fn read_entries(&self, shift_id: &ShiftId) -> Result<Vec<PersistedScan>, LedgerIoError> {
        Ok(self
            .read_file(shift_id)
            .await?
            .into_iter()
            .filter(|entry| entry.shift_id == *shift_id)
            .collect())
    }

    /// Every parseable line of the shift's file, whichever shift wrote it
    async fn read_file(&self, shift_id: &ShiftId) -> Result<Vec<PersistedScan>, LedgerIoError> {
        let path = self.shift_file_path(shift_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (line_number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PersistedScan>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    shift_id = %shift_id,
                    file = ?path,
                    line = line_number + 1,
                    error = %e,
                    "Skipping unreadable ledger line"
                ),
            }
        }
        Ok(entries)
    }

    async fn indexed_keys(&self, shift_id: &ShiftId) -> Result<(), LedgerIoError> {
        if self.key_index.read().await.contains_key(shift_id) {
            return Ok(());
        }
        let keys = self
            .read_entries(shift_id)
            .await?
            .iter()
            .map(|entry| entry.unit.dedup_key())
            .collect();
        self.key_index.write().await.entry(shift_id.clone()).or_insert(keys);
        Ok(())
    }
}

#[async_trait]
impl ScanStore for JsonlScanStore {
    async fn persist_scan(
        &self,
        shift_id: &ShiftId,
        unit: &UnitCode,
        metadata: &ScanMetadata,
    ) -> Result<(), LedgerIoError> {
        let entry = PersistedScan {
            shift_id: shift_id.clone(),
            unit: unit.clone(),
            timestamp: Utc::now(),
            metadata: metadata.clone(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.directory).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.shift_file_path(shift_id))
            .await?;

        // A torn final line must not swallow this record
        let len = file.metadata().await?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                line.insert(0, '\n');
            }
        }

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;

        if let Some(keys) = self.key_index.write().await.get_mut(shift_id) {
            keys.insert(unit.dedup_key());
        }

        debug!(shift_id = %shift_id, unit = %unit, "Persisted scan");
        Ok(())
    }

    async fn query_persisted_scans(&self, shift_id: &ShiftId) -> Result<Vec<PersistedScan>, LedgerIoError> {
        self.read_entries(shift_id).await
    }

    async fn contains(&self, shift_id: &ShiftId, dedup_key: &str) -> Result<bool, LedgerIoError> {
        self.indexed_keys(shift_id).await?;
        Ok(self
            .key_index
            .read()
            .await
            .get(shift_id)
            .is_some_and(|keys| keys.contains(dedup_key)))
    }

    async fn delete_scans(&self, shift_id: &ShiftId, dedup_keys: &[String]) -> Result<usize, LedgerIoError> {
        let _guard = self.write_lock.lock().await;
        let entries = self.read_file(shift_id).await?;
        let before = entries.len();
        let kept: Vec<_> = entries
            .into_iter()
            .filter(|entry| entry.shift_id != *shift_id || !dedup_keys.contains(&entry.unit.dedup_key()))
            .collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut serialized = String::new();
        for entry in &kept {
            serialized.push_str(&serde_json::to_string(entry)?);
            serialized.push('\n');
        }

        // Write to temporary file first, then rename (atomic operation)
        let path = self.shift_file_path(shift_id);
        let temp_path = path.with_extension("jsonl.tmp");
        fs::write(&temp_path, serialized).await?;
        fs::rename(&temp_path, &path).await?;

        if let Some(keys) = self.key_index.write().await.get_mut(shift_id) {
            for key in dedup_keys {
                keys.remove(key);
            }
        }

        debug!(shift_id = %shift_id, removed, "Deleted persisted scans");
        Ok(removed)
    }

    async fn clear_shift(&self, shift_id: &ShiftId) -> Result<(), LedgerIoError> {
        let _guard = self.write_lock.lock().await;
        self.key_index.write().await.remove(shift_id);
        match fs::remove_file(self.shift_file_path(shift_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

const STEM_HASH_LEN: usize = 12;

/// File-name-safe stem for an id
///
/// Ids made only of `[A-Za-z0-9_-]` are used as-is. Anything else is replaced
/// with `_` and a `.`-separated digest of the raw id is appended, so two
/// distinct ids never share a file.
pub fn sanitize_file_stem(value: &str) -> String {
    let is_safe = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !value.is_empty() && value.chars().all(is_safe) {
        return value.to_string();
    }

    let replaced: String = value.chars().map(|c| if is_safe(c) { c } else { '_' }).collect();
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    format!("{replaced}.{}", &digest[..STEM_HASH_LEN])
}
