// Scan Ledger - per-shift uniqueness record of accepted unit scans
//
// The ledger merges an in-memory index with a durable `ScanStore`. The store
// is a collaborator; the merge and dedup policy live here. Durable failures
// never block scanning: they are logged and the ledger degrades to
// memory-only dedup until the store answers again.

pub mod merge;
#[cfg(feature = "database")]
pub mod sqlite;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{CaseCode, UnitCode};
use crate::types::ShiftId;

pub use merge::{merge_records, MergeOutcome};
#[cfg(feature = "database")]
pub use sqlite::SqliteScanStore;
pub use store::{JsonlScanStore, MemoryScanStore, PersistedScan, ScanMetadata, ScanStore};

/// Errors from the durable scan store
#[derive(Debug, Error)]
pub enum LedgerIoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Scan store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Where a ledger record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOrigin {
    /// Accepted by this process
    Cache,
    /// Recovered from the durable store
    Backup,
}

/// One accepted unit scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub unit_code: UnitCode,
    pub shift_id: ShiftId,
    pub timestamp: DateTime<Utc>,
    pub origin: ScanOrigin,
    pub metadata: ScanMetadata,
}

impl From<PersistedScan> for ScanRecord {
    fn from(scan: PersistedScan) -> Self {
        Self {
            unit_code: scan.unit,
            shift_id: scan.shift_id,
            timestamp: scan.timestamp,
            origin: ScanOrigin::Backup,
            metadata: scan.metadata,
        }
    }
}

/// Summary of a `reconcile` run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub loaded_from_store: usize,
    pub adopted: usize,
    pub total: usize,
    pub degraded: bool,
}

/// Uniqueness ledger for one shift
pub struct ScanLedger {
    shift_id: ShiftId,
    store: Arc<dyn ScanStore>,
    index: BTreeMap<String, ScanRecord>,
    degraded: bool,
    reconciled: bool,
}

impl std::fmt::Debug for ScanLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanLedger")
            .field("shift_id", &self.shift_id)
            .field("entries", &self.index.len())
            .field("degraded", &self.degraded)
            .field("reconciled", &self.reconciled)
            .finish()
    }
}

impl ScanLedger {
    pub fn new(shift_id: ShiftId, store: Arc<dyn ScanStore>) -> Self {
        Self {
            shift_id,
            store,
            index: BTreeMap::new(),
            degraded: false,
            reconciled: false,
        }
    }

    pub fn shift_id(&self) -> &ShiftId {
        &self.shift_id
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// True once a durable operation has failed; dedup is memory-only until
    /// the next successful store call
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled
    }

    pub fn records(&self) -> impl Iterator<Item = &ScanRecord> {
        self.index.values()
    }

    pub fn get(&self, unit: &UnitCode) -> Option<&ScanRecord> {
        self.index.get(&unit.dedup_key())
    }

    /// Records stamped with a given open box
    pub fn records_for_case(&self, case_code: &CaseCode, box_epoch: u64) -> Vec<&ScanRecord> {
        let mut records: Vec<_> = self
            .index
            .values()
            .filter(|r| r.metadata.case_code.as_ref() == Some(case_code) && r.metadata.box_epoch == box_epoch)
            .collect();
        records.sort_by_key(|r| r.timestamp);
        records
    }

    /// Load every durable entry for the shift into the memory index.
    ///
    /// Must finish before the first scan is accepted. A store failure leaves
    /// the index as it was and marks the ledger degraded.
    pub async fn reconcile(&mut self) -> ReconcileReport {
        match self.store.query_persisted_scans(&self.shift_id).await {
            Ok(persisted) => {
                let loaded = persisted.len();
                let outcome = merge_records(
                    &self.index,
                    persisted
                        .into_iter()
                        .filter(|scan| scan.shift_id == self.shift_id)
                        .map(ScanRecord::from),
                );
                self.index = outcome.records;
                self.degraded = false;
                self.reconciled = true;

                info!(
                    shift_id = %self.shift_id,
                    loaded,
                    adopted = outcome.adopted_from_backup,
                    total = self.index.len(),
                    "Scan ledger reconciled with durable store"
                );

                ReconcileReport {
                    loaded_from_store: loaded,
                    adopted: outcome.adopted_from_backup,
                    total: self.index.len(),
                    degraded: false,
                }
            }
            Err(e) => {
                self.mark_degraded("reconcile", &e);
                self.reconciled = true;
                ReconcileReport {
                    total: self.index.len(),
                    degraded: true,
                    ..Default::default()
                }
            }
        }
    }

    /// True if the unit was already accepted this shift, in memory or on disk
    pub async fn is_duplicate(&mut self, unit: &UnitCode) -> bool {
        let key = unit.dedup_key();
        if self.index.contains_key(&key) {
            return true;
        }

        match self.store.contains(&self.shift_id, &key).await {
            Ok(found) => {
                self.degraded = false;
                found
            }
            Err(e) => {
                self.mark_degraded("duplicate check", &e);
                false
            }
        }
    }

    /// Record an accepted unit. First write wins: returns `false` and leaves
    /// the existing record untouched if the key is already present.
    ///
    /// Only the memory index is consulted here; callers that decided "not a
    /// duplicate" must have awaited `is_duplicate` first.
    pub async fn accept(&mut self, unit: &UnitCode, metadata: ScanMetadata) -> bool {
        let key = unit.dedup_key();
        if self.index.contains_key(&key) {
            debug!(shift_id = %self.shift_id, unit = %unit, "Unit already in ledger");
            return false;
        }

        self.index.insert(
            key,
            ScanRecord {
                unit_code: unit.clone(),
                shift_id: self.shift_id.clone(),
                timestamp: Utc::now(),
                origin: ScanOrigin::Cache,
                metadata: metadata.clone(),
            },
        );

        match self.store.persist_scan(&self.shift_id, unit, &metadata).await {
            Ok(()) => self.degraded = false,
            Err(e) => self.mark_degraded("persist scan", &e),
        }
        true
    }

    /// Drop units from the memory index. Returns the dedup keys that were
    /// present; the caller issues the matching durable delete with
    /// `purge_durable`.
    pub fn remove(&mut self, units: &[UnitCode]) -> Vec<String> {
        let removed: Vec<String> = units
            .iter()
            .map(UnitCode::dedup_key)
            .filter(|key| self.index.remove(key).is_some())
            .collect();

        debug!(
            shift_id = %self.shift_id,
            requested = units.len(),
            removed = removed.len(),
            "Removed units from ledger"
        );
        removed
    }

    /// Durable counterpart of `remove`
    pub async fn purge_durable(&mut self, dedup_keys: &[String]) {
        if dedup_keys.is_empty() {
            return;
        }
        match self.store.delete_scans(&self.shift_id, dedup_keys).await {
            Ok(deleted) => {
                self.degraded = false;
                debug!(shift_id = %self.shift_id, deleted, "Purged durable scans");
            }
            Err(e) => self.mark_degraded("delete scans", &e),
        }
    }

    /// Wipe the shift's ledger, memory and durable
    pub async fn clear(&mut self) {
        let dropped = self.index.len();
        self.index.clear();
        match self.store.clear_shift(&self.shift_id).await {
            Ok(()) => self.degraded = false,
            Err(e) => self.mark_degraded("clear shift", &e),
        }
        info!(shift_id = %self.shift_id, dropped, "Scan ledger cleared");
    }

    fn mark_degraded(&mut self, operation: &str, error: &LedgerIoError) {
        if !self.degraded {
            warn!(
                shift_id = %self.shift_id,
                operation,
                error = %error,
                "Durable scan store failed; dedup continues from memory only"
            );
        } else {
            debug!(shift_id = %self.shift_id, operation, error = %error, "Durable scan store still failing");
        }
        self.degraded = true;
    }
}
