// Station runtime - registry of per-shift workers sharing one set of stores,
// collaborators and one reservation gate.

pub mod lock;
pub mod operator;
pub mod worker;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

use crate::collaborators::{LocalCaseCodeService, ReservationError, SpoolLabelPrinter};
use crate::config::{LedgerBackend, PacklineConfig};
use crate::ledger::{JsonlScanStore, LedgerIoError, MemoryScanStore, ScanStore};
use crate::packer::ReservationGate;
use crate::session::{
    FileSnapshotStore, OpenReport, SessionCollaborators, SessionConfig, SessionError, SessionMode, ShiftPackagingSession,
    SnapshotStore,
};
use crate::types::{ProductId, ProductInfo, ShiftId};

pub use lock::StationLock;
pub use operator::{parse_operator_line, OperatorCommand, OperatorInput, OperatorParseError};
pub use worker::{spawn_shift_worker, ShiftHandle, ShiftStatus};

#[derive(Debug, Error)]
pub enum StationError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Unknown product {product_id}")]
    UnknownProduct { product_id: ProductId },

    #[error("Shift {shift_id} is already open on this station")]
    ShiftAlreadyOpen { shift_id: ShiftId },

    #[error("Shift {shift_id} is not open on this station")]
    ShiftNotOpen { shift_id: ShiftId },

    #[error("Worker for shift {shift_id} has stopped")]
    WorkerStopped { shift_id: ShiftId },

    #[error("Scan store error: {0}")]
    Ledger(#[from] LedgerIoError),

    #[error("Case code service setup failed: {0}")]
    CaseCodes(#[from] ReservationError),

    #[error("Station data directory is locked by another process ({})", path.display())]
    Locked { path: PathBuf },

    #[error("Configuration error: {reason}")]
    Config { reason: String },
}

/// Options for opening one shift
#[derive(Debug, Clone)]
pub struct ShiftOptions {
    pub shift_id: ShiftId,
    pub product_id: ProductId,
    /// Falls back to the station's default capacity
    pub capacity: Option<u32>,
    pub mode: SessionMode,
}

pub struct Station {
    station_id: String,
    default_capacity: u32,
    products: HashMap<ProductId, ProductInfo>,
    collaborators: SessionCollaborators,
    shifts: Mutex<HashMap<ShiftId, ShiftHandle>>,
    /// Shifts between the open check and their worker being registered
    opening: Mutex<HashSet<ShiftId>>,
}

/// Holds a shift id in `Station::opening` until dropped
struct OpeningClaim<'a> {
    opening: &'a Mutex<HashSet<ShiftId>>,
    shift_id: ShiftId,
}

impl Drop for OpeningClaim<'_> {
    fn drop(&mut self) {
        self.opening
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.shift_id);
    }
}

impl std::fmt::Debug for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Station")
            .field("station_id", &self.station_id)
            .field("default_capacity", &self.default_capacity)
            .field("products", &self.products.len())
            .field("open_shifts", &self.open_shifts())
            .finish()
    }
}

impl Station {
    pub fn new(
        station_id: impl Into<String>,
        default_capacity: u32,
        products: impl IntoIterator<Item = ProductInfo>,
        collaborators: SessionCollaborators,
    ) -> Self {
        Self {
            station_id: station_id.into(),
            default_capacity,
            products: products.into_iter().map(|p| (p.id.clone(), p)).collect(),
            collaborators,
            shifts: Mutex::new(HashMap::new()),
            opening: Mutex::new(HashSet::new()),
        }
    }

    /// Wire stores and local collaborators from configuration
    pub async fn from_config(config: &PacklineConfig) -> Result<Self, StationError> {
        let scan_store = scan_store_from_config(config).await?;

        let snapshots: Option<Arc<dyn SnapshotStore>> = if config.snapshots.enabled {
            Some(Arc::new(FileSnapshotStore::new(config.snapshot_dir())))
        } else {
            None
        };

        let case_codes = LocalCaseCodeService::new(
            config.case_codes.extension_digit,
            config.case_codes.company_prefix.clone(),
            config.counter_path(),
            config.manifest_dir(),
        )?;

        info!(
            station_id = %config.station.id,
            ledger = ?config.ledger.backend,
            snapshots = config.snapshots.enabled,
            "Station configured"
        );

        Ok(Self::new(
            config.station.id.clone(),
            config.station.default_capacity,
            config.products.iter().cloned(),
            SessionCollaborators {
                scan_store,
                case_codes: Arc::new(case_codes),
                printer: Arc::new(SpoolLabelPrinter::new(config.spool_dir())),
                snapshots,
                gate: ReservationGate::new(),
            },
        ))
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn product(&self, product_id: &ProductId) -> Option<&ProductInfo> {
        self.products.get(product_id)
    }

    /// Open a shift: reconcile its ledger, restore its open box and start its
    /// worker
    ///
    /// Concurrent opens of the same shift are refused while the first one is
    /// still reconciling, so a shift never has two workers.
    pub async fn open_shift(&self, options: ShiftOptions) -> Result<(ShiftHandle, OpenReport), StationError> {
        let _claim = self.claim_shift(&options.shift_id)?;
        let product = self
            .products
            .get(&options.product_id)
            .cloned()
            .ok_or_else(|| StationError::UnknownProduct {
                product_id: options.product_id.clone(),
            })?;

        let config = SessionConfig::new(
            options.shift_id.clone(),
            product,
            options.capacity.unwrap_or(self.default_capacity),
        )
        .with_mode(options.mode)
        .with_station_id(self.station_id.clone());

        let (session, report) = ShiftPackagingSession::open(config, self.collaborators.clone()).await?;
        let handle = spawn_shift_worker(session, self.station_id.clone(), &report.reconcile);
        self.lock_shifts().insert(options.shift_id, handle.clone());
        Ok((handle, report))
    }

    fn claim_shift(&self, shift_id: &ShiftId) -> Result<OpeningClaim<'_>, StationError> {
        let shifts = self.lock_shifts();
        let mut opening = self.opening.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if shifts.contains_key(shift_id) || !opening.insert(shift_id.clone()) {
            return Err(StationError::ShiftAlreadyOpen {
                shift_id: shift_id.clone(),
            });
        }
        Ok(OpeningClaim {
            opening: &self.opening,
            shift_id: shift_id.clone(),
        })
    }

    pub fn shift(&self, shift_id: &ShiftId) -> Option<ShiftHandle> {
        self.lock_shifts().get(shift_id).cloned()
    }

    pub fn open_shifts(&self) -> Vec<ShiftId> {
        let mut shifts: Vec<ShiftId> = self.lock_shifts().keys().cloned().collect();
        shifts.sort();
        shifts
    }

    /// End the shift and drop the station's handle to its worker
    pub async fn close_shift(&self, shift_id: &ShiftId) -> Result<(), StationError> {
        let handle = self.shift(shift_id).ok_or_else(|| StationError::ShiftNotOpen {
            shift_id: shift_id.clone(),
        })?;
        handle.end_shift().await?;
        self.lock_shifts().remove(shift_id);
        info!(station_id = %self.station_id, shift_id = %shift_id, "Shift closed");
        Ok(())
    }

    fn lock_shifts(&self) -> std::sync::MutexGuard<'_, HashMap<ShiftId, ShiftHandle>> {
        self.shifts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The durable scan store selected by `ledger.backend`
pub async fn scan_store_from_config(config: &PacklineConfig) -> Result<Arc<dyn ScanStore>, StationError> {
    let store: Arc<dyn ScanStore> = match config.ledger.backend {
        LedgerBackend::Jsonl => Arc::new(JsonlScanStore::new(config.ledger_dir())),
        LedgerBackend::Memory => Arc::new(MemoryScanStore::new()),
        #[cfg(feature = "database")]
        LedgerBackend::Sqlite => Arc::new(crate::ledger::SqliteScanStore::connect(&config.database_url()).await?),
        #[cfg(not(feature = "database"))]
        LedgerBackend::Sqlite => {
            return Err(StationError::Config {
                reason: "the sqlite ledger backend requires the `database` feature".to_string(),
            })
        }
    };
    Ok(store)
}
