use std::collections::BTreeMap;

use super::{ScanOrigin, ScanRecord};

/// Result of merging the memory cache with durable backup entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub records: BTreeMap<String, ScanRecord>,
    /// Backup entries adopted because the cache had no record for them
    pub adopted_from_backup: usize,
    /// Backup entries dropped because the key was already present
    pub conflicts: usize,
}

/// Merge two overlapping keyed collections, cache first.
///
/// Cache records always win. Among backup entries sharing a key, the first
/// one wins. Adopted backup entries keep `ScanOrigin::Backup` so callers can
/// tell which records were recovered from disk.
pub fn merge_records<I>(cache: &BTreeMap<String, ScanRecord>, backup: I) -> MergeOutcome
where
    I: IntoIterator<Item = ScanRecord>,
{
    let mut outcome = MergeOutcome {
        records: cache.clone(),
        ..Default::default()
    };

    for mut record in backup {
        let key = record.unit_code.dedup_key();
        if outcome.records.contains_key(&key) {
            outcome.conflicts += 1;
            continue;
        }
        record.origin = ScanOrigin::Backup;
        outcome.records.insert(key, record);
        outcome.adopted_from_backup += 1;
    }

    outcome
}
