//! Shared fakes for the packing integration tests
//!
//! Collaborators here record every call so tests can assert on how often
//! the backend and printer were reached.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use packline::codec::{compute_case_check_digit, CaseCode, GROUP_SEPARATOR};
use packline::collaborators::{
    CaseCodeService, CommitError, CommitRequest, LabelPayload, LabelPrinter, PrintError, ReservationError,
};
use packline::codec::UnitCode;
use packline::ledger::{LedgerIoError, MemoryScanStore, PersistedScan, ScanMetadata, ScanStore};
use packline::packer::ReservationGate;
use packline::session::{SessionCollaborators, SessionConfig, SnapshotStore};
use packline::types::{ProductId, ProductInfo, Reservation, ReservationId, ShiftId};

pub const GTIN: &str = "04600417010234";
pub const OTHER_GTIN: &str = "04600417099999";

pub fn product() -> ProductInfo {
    ProductInfo {
        id: ProductId::new("milk-1l"),
        name: "Milk 1L".to_string(),
        gtin: GTIN.to_string(),
        expiration_in_days: 10,
    }
}

pub fn planned_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 2).unwrap_or_default()
}

/// Raw DataMatrix payload for serial `n` of the test product
pub fn raw_unit(n: u32) -> String {
    raw_unit_for(GTIN, n)
}

pub fn raw_unit_for(gtin: &str, n: u32) -> String {
    format!("01{gtin}215S{n:05}{GROUP_SEPARATOR}93Ab{:02}", n % 100)
}

/// Valid SSCC built from extension digit 1, prefix 4912345 and `serial`
pub fn case_code(serial: u64) -> CaseCode {
    let body = format!("14912345{serial:09}");
    let check = compute_case_check_digit(&body).unwrap_or_default();
    CaseCode::parse(&format!("{body}{check}")).unwrap()
}

pub fn session_config(shift: &str, capacity: u32) -> SessionConfig {
    SessionConfig::new(ShiftId::new(shift), product(), capacity)
        .with_station_id("station-test")
        .with_planned_date(planned_date())
}

/// Case-code backend handing out sequential SSCCs
#[derive(Default)]
pub struct CountingCaseCodes {
    next_serial: AtomicU64,
    pub reservations: AtomicUsize,
    pub commits: Mutex<Vec<CommitRequest>>,
    reserve_delay: Option<Duration>,
    commit_failures: Mutex<VecDeque<CommitError>>,
}

impl CountingCaseCodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slow reservations, to widen the window for concurrent callers
    pub fn with_reserve_delay(mut self, delay: Duration) -> Self {
        self.reserve_delay = Some(delay);
        self
    }

    pub fn fail_next_commit(&self, error: CommitError) {
        self.commit_failures.lock().unwrap().push_back(error);
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> Vec<CommitRequest> {
        self.commits.lock().unwrap().clone()
    }

    fn next_reservation(&self) -> Reservation {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        Reservation {
            case_code: case_code(serial),
            reservation_id: ReservationId::new(format!("res-{serial}")),
        }
    }
}

#[async_trait]
impl CaseCodeService for CountingCaseCodes {
    async fn reserve_next_case_code(
        &self,
        _shift_id: &ShiftId,
        _product_id: &ProductId,
    ) -> Result<Reservation, ReservationError> {
        if let Some(delay) = self.reserve_delay {
            tokio::time::sleep(delay).await;
        }
        self.reservations.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_reservation())
    }

    async fn commit_packed_case(&self, request: &CommitRequest) -> Result<Reservation, CommitError> {
        if let Some(error) = self.commit_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.commits.lock().unwrap().push(request.clone());
        Ok(self.next_reservation())
    }
}

/// Printer answering from a script of results, then succeeding
#[derive(Default)]
pub struct ScriptedPrinter {
    script: Mutex<VecDeque<Result<(), PrintError>>>,
    pub printed: Mutex<Vec<LabelPayload>>,
    pub calls: AtomicUsize,
}

impl ScriptedPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_once(reason: &str) -> Self {
        let printer = Self::default();
        printer.script.lock().unwrap().push_back(Err(PrintError::Unavailable {
            reason: reason.to_string(),
        }));
        printer
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn labels(&self) -> Vec<LabelPayload> {
        self.printed.lock().unwrap().clone()
    }
}

#[async_trait]
impl LabelPrinter for ScriptedPrinter {
    async fn print(&self, label: &LabelPayload) -> Result<(), PrintError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.printed.lock().unwrap().push(label.clone());
        }
        result
    }
}

/// Printer that holds every job until the test releases it
#[derive(Default)]
pub struct GatedPrinter {
    pub started: Notify,
    release: Notify,
}

impl GatedPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl LabelPrinter for GatedPrinter {
    async fn print(&self, _label: &LabelPayload) -> Result<(), PrintError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

/// In-memory store whose reads take a while, like a remote ledger
pub struct SlowScanStore {
    inner: MemoryScanStore,
    delay: Duration,
}

impl SlowScanStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryScanStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl ScanStore for SlowScanStore {
    async fn persist_scan(
        &self,
        shift_id: &ShiftId,
        unit: &UnitCode,
        metadata: &ScanMetadata,
    ) -> Result<(), LedgerIoError> {
        self.inner.persist_scan(shift_id, unit, metadata).await
    }

    async fn query_persisted_scans(&self, shift_id: &ShiftId) -> Result<Vec<PersistedScan>, LedgerIoError> {
        tokio::time::sleep(self.delay).await;
        self.inner.query_persisted_scans(shift_id).await
    }

    async fn contains(&self, shift_id: &ShiftId, dedup_key: &str) -> Result<bool, LedgerIoError> {
        self.inner.contains(shift_id, dedup_key).await
    }

    async fn delete_scans(&self, shift_id: &ShiftId, dedup_keys: &[String]) -> Result<usize, LedgerIoError> {
        self.inner.delete_scans(shift_id, dedup_keys).await
    }

    async fn clear_shift(&self, shift_id: &ShiftId) -> Result<(), LedgerIoError> {
        self.inner.clear_shift(shift_id).await
    }
}

pub struct Harness {
    pub store: Arc<dyn ScanStore>,
    pub case_codes: Arc<CountingCaseCodes>,
    pub printer: Arc<dyn LabelPrinter>,
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
    pub gate: ReservationGate,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_printer(Arc::new(ScriptedPrinter::new()))
    }

    pub fn with_printer(printer: Arc<dyn LabelPrinter>) -> Self {
        Self {
            store: Arc::new(MemoryScanStore::new()),
            case_codes: Arc::new(CountingCaseCodes::new()),
            printer,
            snapshots: None,
            gate: ReservationGate::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ScanStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn collaborators(&self) -> SessionCollaborators {
        SessionCollaborators {
            scan_store: self.store.clone(),
            case_codes: self.case_codes.clone(),
            printer: self.printer.clone(),
            snapshots: self.snapshots.clone(),
            gate: self.gate.clone(),
        }
    }
}
