// Shift Packaging Session - per-shift orchestrator
//
// Single entry point for raw scans. Each scan goes through a fixed order:
// decode, dedup, product match, ledger accept, packer accept. The session
// also relays packer lifecycle events to subscribers and keeps a box
// snapshot on disk so a restarted station resumes the open case.

pub mod snapshot;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::codec::{decode_unit, matches_product, normalize_case, CaseCode, DecodeError, UnitCode};
use crate::collaborators::{CaseCodeService, CommitError, CommitRequest, LabelPayload, LabelPrinter, PrintError};
use crate::ledger::{ReconcileReport, ScanLedger, ScanMetadata, ScanStore};
use crate::packer::{
    AcceptReport, BoxLifecycle, BoxPacker, BoxStatus, CommittedBox, PackagingPhase, PackerError, ReservationGate,
};
use crate::types::{ProductInfo, Reservation, ShiftId};

pub use snapshot::{BoxSnapshot, CheckpointMetadata, CheckpointReason, FileSnapshotStore, SnapshotError, SnapshotStore};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Whether scans are boxed or only recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Packaging,
    /// Dedupe and record units without packing them into cases
    ScanOnly,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub shift_id: ShiftId,
    pub product: ProductInfo,
    pub capacity: u32,
    pub mode: SessionMode,
    pub station_id: Option<String>,
    pub planned_date: Option<NaiveDate>,
}

impl SessionConfig {
    pub fn new(shift_id: ShiftId, product: ProductInfo, capacity: u32) -> Self {
        Self {
            shift_id,
            product,
            capacity,
            mode: SessionMode::Packaging,
            station_id: None,
            planned_date: None,
        }
    }

    pub fn with_mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_station_id(mut self, station_id: impl Into<String>) -> Self {
        self.station_id = Some(station_id.into());
        self
    }

    pub fn with_planned_date(mut self, planned_date: NaiveDate) -> Self {
        self.planned_date = Some(planned_date);
        self
    }
}

/// Everything a session talks to
#[derive(Clone)]
pub struct SessionCollaborators {
    pub scan_store: Arc<dyn ScanStore>,
    pub case_codes: Arc<dyn CaseCodeService>,
    pub printer: Arc<dyn LabelPrinter>,
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
    pub gate: ReservationGate,
}

/// Classification of one raw scan. Everything except `Accepted` leaves the
/// session untouched.
///
/// Checks run in a fixed order and the first that fails decides the outcome:
/// box readiness (`Rejected`, packaging mode only), decoding (`Malformed`),
/// the ledger (`Duplicate`), then the product (`WrongProduct`). A scan
/// arriving while a label is printing is therefore `Rejected` even if it is
/// also malformed or already recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// `report` is `None` in scan-only mode
    Accepted {
        unit: UnitCode,
        report: Option<AcceptReport>,
    },
    Duplicate {
        unit: UnitCode,
    },
    WrongProduct {
        unit: UnitCode,
        expected_gtin: String,
    },
    Malformed {
        error: DecodeError,
    },
    /// The box is not taking units right now (not initialized, full, or a
    /// print/verify round trip is outstanding). Takes precedence over every
    /// other classification.
    Rejected {
        reason: String,
    },
}

impl ScanOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ScanOutcome::Accepted { .. })
    }
}

/// Lifecycle notifications for the operator display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PackagingEvent {
    BoxReadyToPack {
        shift_id: ShiftId,
        case_code: CaseCode,
        item_count: u32,
    },
    LabelPrinted {
        shift_id: ShiftId,
        case_code: CaseCode,
    },
    PrintFailed {
        shift_id: ShiftId,
        case_code: CaseCode,
        reason: String,
    },
    VerificationSucceeded {
        shift_id: ShiftId,
        case_code: CaseCode,
        next_case_code: CaseCode,
        unit_count: usize,
    },
    VerificationFailed {
        shift_id: ShiftId,
        case_code: CaseCode,
        reason: String,
    },
    BoxCancelled {
        shift_id: ShiftId,
        case_code: CaseCode,
        discarded: usize,
    },
    BoxReset {
        shift_id: ShiftId,
        case_code: CaseCode,
        removed: usize,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Packer(#[from] PackerError),

    #[error("Invalid case code scan: {0}")]
    InvalidCaseScan(#[from] DecodeError),

    #[error("Shift {shift_id} runs in scan-only mode")]
    NotPackaging { shift_id: ShiftId },

    #[error("Scan history can only be cleared in scan-only mode")]
    HistoryLocked,
}

/// What `open` found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenReport {
    pub reconcile: ReconcileReport,
    pub restored_phase: Option<PackagingPhase>,
    pub adopted_units: usize,
}

pub struct ShiftPackagingSession {
    config: SessionConfig,
    ledger: ScanLedger,
    packer: BoxPacker,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    events: broadcast::Sender<PackagingEvent>,
}

impl std::fmt::Debug for ShiftPackagingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShiftPackagingSession")
            .field("shift_id", &self.config.shift_id)
            .field("mode", &self.config.mode)
            .field("ledger", &self.ledger)
            .field("packer", &self.packer)
            .field("snapshots", &self.snapshots.is_some())
            .finish()
    }
}

impl ShiftPackagingSession {
    /// Build a session without touching the durable store. The ledger is
    /// reconciled lazily before the first scan; prefer `open`.
    pub fn new(config: SessionConfig, collaborators: SessionCollaborators) -> Self {
        let ledger = ScanLedger::new(config.shift_id.clone(), collaborators.scan_store);
        let mut packer = BoxPacker::new(
            config.shift_id.clone(),
            config.product.clone(),
            config.capacity,
            collaborators.case_codes,
            collaborators.printer,
        )
        .with_gate(collaborators.gate);
        if let Some(planned_date) = config.planned_date {
            packer = packer.with_planned_date(planned_date);
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            ledger,
            packer,
            snapshots: collaborators.snapshots,
            events,
        }
    }

    /// Build a session, reconcile its ledger, then restore the open box from
    /// the last snapshot
    pub async fn open(
        config: SessionConfig,
        collaborators: SessionCollaborators,
    ) -> Result<(Self, OpenReport), SessionError> {
        let mut session = Self::new(config, collaborators);
        let reconcile = session.ledger.reconcile().await;

        let mut report = OpenReport {
            reconcile,
            restored_phase: None,
            adopted_units: 0,
        };
        if session.config.mode == SessionMode::Packaging {
            if let Some(snapshot) = session.load_snapshot().await {
                let (phase, adopted) = session.restore_snapshot(snapshot).await?;
                report.restored_phase = Some(phase);
                report.adopted_units = adopted;
            }
        }

        info!(
            shift_id = %session.config.shift_id,
            mode = ?session.config.mode,
            ledger_entries = session.ledger.len(),
            degraded = session.ledger.is_degraded(),
            restored_phase = ?report.restored_phase,
            adopted_units = report.adopted_units,
            "Shift session opened"
        );
        Ok((session, report))
    }

    pub fn shift_id(&self) -> &ShiftId {
        &self.config.shift_id
    }

    pub fn mode(&self) -> SessionMode {
        self.config.mode
    }

    pub fn product(&self) -> &ProductInfo {
        &self.config.product
    }

    pub fn ledger(&self) -> &ScanLedger {
        &self.ledger
    }

    pub fn packer(&self) -> &BoxPacker {
        &self.packer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PackagingEvent> {
        self.events.subscribe()
    }

    pub fn get_box_status(&self) -> BoxStatus {
        self.packer.status()
    }

    /// Classify and, if valid, record one raw scan
    pub async fn accept_raw_scan(&mut self, raw: &str) -> ScanOutcome {
        if !self.ledger.is_reconciled() {
            self.ledger.reconcile().await;
        }

        let packaging = self.config.mode == SessionMode::Packaging;
        if packaging {
            if let Err(e) = self.packer.can_accept() {
                debug!(shift_id = %self.config.shift_id, reason = %e, "Scan rejected");
                return ScanOutcome::Rejected { reason: e.to_string() };
            }
        }

        let unit = match decode_unit(raw) {
            Ok(unit) => unit,
            Err(error) => {
                debug!(shift_id = %self.config.shift_id, error = %error, "Malformed scan");
                return ScanOutcome::Malformed { error };
            }
        };

        if self.ledger.is_duplicate(&unit).await {
            info!(shift_id = %self.config.shift_id, unit = %unit, "Duplicate scan");
            return ScanOutcome::Duplicate { unit };
        }

        if !matches_product(&unit, &self.config.product.gtin) {
            info!(
                shift_id = %self.config.shift_id,
                unit = %unit,
                expected_gtin = %self.config.product.gtin,
                "Wrong product scanned"
            );
            return ScanOutcome::WrongProduct {
                unit,
                expected_gtin: self.config.product.gtin.clone(),
            };
        }

        let state = self.packer.box_state();
        let metadata = ScanMetadata {
            product_id: Some(self.config.product.id.clone()),
            case_code: if packaging { state.reserved_case_code.clone() } else { None },
            box_epoch: state.box_epoch,
            station_id: self.config.station_id.clone(),
        };
        if !self.ledger.accept(&unit, metadata).await {
            return ScanOutcome::Duplicate { unit };
        }

        if !packaging {
            return ScanOutcome::Accepted { unit, report: None };
        }

        match self.packer.accept_unit(unit.clone()) {
            Ok(report) => {
                if report.box_full {
                    self.publish(PackagingEvent::BoxReadyToPack {
                        shift_id: self.config.shift_id.clone(),
                        case_code: report.case_code.clone(),
                        item_count: report.item_count,
                    });
                }
                self.checkpoint(CheckpointReason::StateTransition).await;
                ScanOutcome::Accepted {
                    unit,
                    report: Some(report),
                }
            }
            Err(e) => {
                let keys = self.ledger.remove(std::slice::from_ref(&unit));
                self.ledger.purge_durable(&keys).await;
                warn!(shift_id = %self.config.shift_id, unit = %unit, error = %e, "Packer refused unit, ledger rolled back");
                ScanOutcome::Rejected { reason: e.to_string() }
            }
        }
    }

    /// Reserve the first case code of the shift; idempotent
    pub async fn initialize_box(&mut self) -> Result<CaseCode, SessionError> {
        self.require_packaging()?;
        let shift_id = self.config.shift_id.clone();
        let product_id = self.config.product.id.clone();
        let case_code = self
            .packer
            .initialize(&shift_id, &product_id, self.config.capacity)
            .await?;
        self.checkpoint(CheckpointReason::StateTransition).await;
        Ok(case_code)
    }

    /// First half of printing: move the open box to `AwaitingPrint`
    pub async fn begin_print(&mut self, case_code: &CaseCode, members: &[UnitCode]) -> Result<LabelPayload, SessionError> {
        self.require_packaging()?;
        let label = self.packer.begin_print(case_code, members)?;
        self.checkpoint(CheckpointReason::StateTransition).await;
        Ok(label)
    }

    /// Label for the open box as it stands
    pub async fn begin_print_current(&mut self) -> Result<LabelPayload, SessionError> {
        let (case_code, members) = self.current_box()?;
        self.begin_print(&case_code, &members).await
    }

    pub async fn complete_print(&mut self, result: Result<(), PrintError>) -> Result<(), SessionError> {
        let case_code = self.current_box()?.0;
        let outcome = self.packer.complete_print(result);
        match &outcome {
            Ok(()) => self.publish(PackagingEvent::LabelPrinted {
                shift_id: self.config.shift_id.clone(),
                case_code,
            }),
            Err(PackerError::Print(e)) => self.publish(PackagingEvent::PrintFailed {
                shift_id: self.config.shift_id.clone(),
                case_code,
                reason: e.to_string(),
            }),
            Err(_) => {}
        }
        self.checkpoint(CheckpointReason::StateTransition).await;
        outcome.map_err(SessionError::from)
    }

    pub async fn request_print_and_verify(
        &mut self,
        case_code: &CaseCode,
        members: &[UnitCode],
    ) -> Result<(), SessionError> {
        let label = self.begin_print(case_code, members).await?;
        let printer = self.packer.printer();
        let result = printer.print(&label).await;
        self.complete_print(result).await
    }

    /// Print the label of the open box as it stands
    pub async fn print_current_box(&mut self) -> Result<(), SessionError> {
        let (case_code, members) = self.current_box()?;
        self.request_print_and_verify(&case_code, &members).await
    }

    /// First half of committing: validate the confirmation and move to
    /// `Committing`. A mismatch publishes `VerificationFailed` and changes
    /// nothing else.
    pub async fn begin_commit(&mut self, case_code: &CaseCode, members: &[UnitCode]) -> Result<CommitRequest, SessionError> {
        self.require_packaging()?;
        match self.packer.begin_commit(case_code, members) {
            Ok(request) => {
                self.checkpoint(CheckpointReason::StateTransition).await;
                Ok(request)
            }
            Err(e) => {
                if matches!(
                    e,
                    PackerError::CaseCodeMismatch { .. } | PackerError::MembershipMismatch { .. }
                ) {
                    self.publish(PackagingEvent::VerificationFailed {
                        shift_id: self.config.shift_id.clone(),
                        case_code: case_code.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e.into())
            }
        }
    }

    pub async fn complete_commit(
        &mut self,
        result: Result<Reservation, CommitError>,
    ) -> Result<CommittedBox, SessionError> {
        let case_code = self.current_box()?.0;
        let outcome = self.packer.complete_commit(result).await;
        match &outcome {
            Ok(committed) => self.publish(PackagingEvent::VerificationSucceeded {
                shift_id: self.config.shift_id.clone(),
                case_code: committed.case_code.clone(),
                next_case_code: committed.next.case_code.clone(),
                unit_count: committed.unit_codes.len(),
            }),
            Err(PackerError::Commit(e)) => self.publish(PackagingEvent::VerificationFailed {
                shift_id: self.config.shift_id.clone(),
                case_code,
                reason: e.to_string(),
            }),
            Err(_) => {}
        }
        self.checkpoint(CheckpointReason::StateTransition).await;
        outcome.map_err(SessionError::from)
    }

    pub async fn confirm_verification(
        &mut self,
        case_code: &CaseCode,
        members: &[UnitCode],
    ) -> Result<CommittedBox, SessionError> {
        let request = self.begin_commit(case_code, members).await?;
        let service = self.packer.case_codes();
        let result = service.commit_packed_case(&request).await;
        self.complete_commit(result).await
    }

    /// Operator scanned the printed case label to confirm it
    pub async fn confirm_scanned_case(&mut self, raw: &str) -> Result<CommittedBox, SessionError> {
        let case_code = normalize_case(raw)?;
        let members = self.packer.box_state().member_unit_codes.clone();
        self.confirm_verification(&case_code, &members).await
    }

    /// Discard the open box's membership; the units stay in the ledger
    pub async fn cancel_current_box(&mut self) -> Result<Vec<UnitCode>, SessionError> {
        self.require_packaging()?;
        let case_code = self.current_box()?.0;
        let discarded = self.packer.cancel_current_box()?;
        self.publish(PackagingEvent::BoxCancelled {
            shift_id: self.config.shift_id.clone(),
            case_code,
            discarded: discarded.len(),
        });
        self.checkpoint(CheckpointReason::StateTransition).await;
        Ok(discarded)
    }

    /// Cancel the open box and roll its members back out of the ledger so
    /// they can be scanned again
    pub async fn reset_current_box(&mut self) -> Result<usize, SessionError> {
        self.require_packaging()?;
        let case_code = self.current_box()?.0;
        let discarded = self.packer.cancel_current_box()?;
        let keys = self.ledger.remove(&discarded);
        self.ledger.purge_durable(&keys).await;

        info!(
            shift_id = %self.config.shift_id,
            case_code = %case_code,
            removed = keys.len(),
            "Open box reset"
        );
        self.publish(PackagingEvent::BoxReset {
            shift_id: self.config.shift_id.clone(),
            case_code,
            removed: keys.len(),
        });
        self.checkpoint(CheckpointReason::StateTransition).await;
        Ok(keys.len())
    }

    /// Wipe the shift's scan history. Refused while packaging: packed cases
    /// reference these units.
    pub async fn clear_history(&mut self) -> Result<usize, SessionError> {
        if self.config.mode == SessionMode::Packaging {
            return Err(SessionError::HistoryLocked);
        }
        let dropped = self.ledger.len();
        self.ledger.clear().await;
        Ok(dropped)
    }

    /// Close the shift: release the reservation gate and drop the snapshot.
    /// The scan ledger is kept.
    pub async fn end_shift(&mut self) -> Result<(), SessionError> {
        let discarded = self.packer.clear().await?;
        if let Some(store) = &self.snapshots {
            if let Err(e) = store.delete(&self.config.shift_id).await {
                warn!(shift_id = %self.config.shift_id, error = %e, "Failed to delete box snapshot");
            }
        }
        info!(
            shift_id = %self.config.shift_id,
            ledger_entries = self.ledger.len(),
            open_units_discarded = discarded.len(),
            "Shift ended"
        );
        Ok(())
    }

    /// Persist the open box one last time before the session is dropped
    /// without ending the shift
    pub async fn suspend(&self) {
        if self.config.mode == SessionMode::Packaging && self.packer.phase() != PackagingPhase::Idle {
            self.checkpoint(CheckpointReason::BeforeShutdown).await;
        }
        debug!(shift_id = %self.config.shift_id, "Session suspended");
    }

    async fn load_snapshot(&self) -> Option<BoxSnapshot> {
        let store = self.snapshots.as_ref()?;
        match store.load(&self.config.shift_id).await {
            Ok(Some(snapshot)) if snapshot.product_id != self.config.product.id => {
                warn!(
                    shift_id = %self.config.shift_id,
                    snapshot_product = %snapshot.product_id,
                    product = %self.config.product.id,
                    "Ignoring box snapshot for another product"
                );
                None
            }
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(shift_id = %self.config.shift_id, error = %e, "Failed to load box snapshot, starting fresh");
                None
            }
        }
    }

    async fn restore_snapshot(&mut self, snapshot: BoxSnapshot) -> Result<(PackagingPhase, usize), SessionError> {
        let saved_phase = snapshot.phase;
        let lifecycle = match BoxLifecycle::restore(snapshot.phase, snapshot.box_state) {
            Ok(lifecycle) => lifecycle,
            Err(e) => {
                warn!(shift_id = %self.config.shift_id, error = %e, "Discarding unusable box snapshot");
                return Ok((PackagingPhase::Idle, 0));
            }
        };
        if lifecycle.phase() != saved_phase {
            info!(
                shift_id = %self.config.shift_id,
                saved = %saved_phase,
                resumed = %lifecycle.phase(),
                "Interrupted collaborator call, phase rolled back"
            );
        }
        self.packer.restore(lifecycle).await?;

        let mut adopted = 0;
        if let Some(case_code) = self.packer.box_state().reserved_case_code.clone() {
            let orphans: Vec<UnitCode> = self
                .ledger
                .records_for_case(&case_code, self.packer.box_state().box_epoch)
                .into_iter()
                .map(|record| record.unit_code.clone())
                .collect();
            adopted = self.packer.adopt_units(orphans);
        }
        self.checkpoint(CheckpointReason::AfterRestore).await;
        Ok((self.packer.phase(), adopted))
    }

    async fn checkpoint(&self, reason: CheckpointReason) {
        let Some(store) = &self.snapshots else {
            return;
        };
        let snapshot = BoxSnapshot::new(
            self.config.product.id.clone(),
            self.packer.phase(),
            self.packer.box_state().clone(),
            reason,
        );
        if let Err(e) = store.save(&snapshot).await {
            warn!(shift_id = %self.config.shift_id, error = %e, "Failed to save box snapshot");
        }
    }

    fn publish(&self, event: PackagingEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn require_packaging(&self) -> Result<(), SessionError> {
        if self.config.mode != SessionMode::Packaging {
            return Err(SessionError::NotPackaging {
                shift_id: self.config.shift_id.clone(),
            });
        }
        Ok(())
    }

    fn current_box(&self) -> Result<(CaseCode, Vec<UnitCode>), SessionError> {
        self.require_packaging()?;
        let state = self.packer.box_state();
        let case_code = state.reserved_case_code.clone().ok_or_else(|| PackerError::NotInitialized {
            shift_id: self.config.shift_id.clone(),
        })?;
        Ok((case_code, state.member_unit_codes.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MockCaseCodeService, MockLabelPrinter};
    use crate::ledger::MemoryScanStore;
    use crate::types::{ProductId, ReservationId};

    const GTIN: &str = "04600417010234";
    const FIRST_CASE: &str = "149123450000000009";

    fn product() -> ProductInfo {
        ProductInfo {
            id: ProductId::new("milk-1l"),
            name: "Milk 1L".to_string(),
            gtin: GTIN.to_string(),
            expiration_in_days: 10,
        }
    }

    fn raw(serial: &str) -> String {
        format!("01{GTIN}215{serial}\u{1d}93ABCD")
    }

    fn collaborators(case_codes: MockCaseCodeService) -> SessionCollaborators {
        SessionCollaborators {
            scan_store: Arc::new(MemoryScanStore::new()),
            case_codes: Arc::new(case_codes),
            printer: Arc::new(MockLabelPrinter::new()),
            snapshots: None,
            gate: ReservationGate::new(),
        }
    }

    fn reserving_service() -> MockCaseCodeService {
        let mut service = MockCaseCodeService::new();
        service.expect_reserve_next_case_code().returning(|_, _| {
            Ok(Reservation {
                case_code: CaseCode::parse(FIRST_CASE).unwrap(),
                reservation_id: ReservationId::new("r-1"),
            })
        });
        service
    }

    async fn packaging_session(capacity: u32) -> ShiftPackagingSession {
        let config = SessionConfig::new(ShiftId::new("shift-1"), product(), capacity);
        let (mut session, _) = ShiftPackagingSession::open(config, collaborators(reserving_service()))
            .await
            .unwrap();
        session.initialize_box().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_scan_before_initialize_is_rejected() {
        let config = SessionConfig::new(ShiftId::new("shift-1"), product(), 6);
        let mut session = ShiftPackagingSession::new(config, collaborators(MockCaseCodeService::new()));

        let outcome = session.accept_raw_scan(&raw("SER001")).await;
        assert!(matches!(outcome, ScanOutcome::Rejected { .. }));
        assert!(session.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_wrong_product_leave_no_trace() {
        let mut session = packaging_session(6).await;

        let outcome = session.accept_raw_scan("garbage").await;
        assert!(matches!(outcome, ScanOutcome::Malformed { .. }));

        let other = "0104600417099999215SER001\u{1d}93ABCD";
        let outcome = session.accept_raw_scan(other).await;
        assert!(matches!(outcome, ScanOutcome::WrongProduct { .. }));

        assert!(session.ledger().is_empty());
        assert_eq!(session.get_box_status().box_state.item_count, 0);
    }

    #[tokio::test]
    async fn test_full_box_publishes_ready_event_and_rejects_more() {
        let mut session = packaging_session(2).await;
        let mut events = session.subscribe();

        assert!(session.accept_raw_scan(&raw("SER001")).await.is_accepted());
        assert!(session.accept_raw_scan(&raw("SER002")).await.is_accepted());

        let event = events.try_recv().unwrap();
        assert!(matches!(event, PackagingEvent::BoxReadyToPack { item_count: 2, .. }));

        let outcome = session.accept_raw_scan(&raw("SER003")).await;
        assert!(matches!(outcome, ScanOutcome::Rejected { .. }));
        assert_eq!(session.ledger().len(), 2);
    }

    #[tokio::test]
    async fn test_reset_rolls_back_ledger_for_current_box() {
        let mut session = packaging_session(3).await;
        session.accept_raw_scan(&raw("SER001")).await;
        session.accept_raw_scan(&raw("SER002")).await;

        let removed = session.reset_current_box().await.unwrap();
        assert_eq!(removed, 2);
        assert!(session.ledger().is_empty());
        assert!(session.accept_raw_scan(&raw("SER001")).await.is_accepted());
    }

    #[tokio::test]
    async fn test_cancel_keeps_units_in_ledger() {
        let mut session = packaging_session(3).await;
        session.accept_raw_scan(&raw("SER001")).await;

        let discarded = session.cancel_current_box().await.unwrap();
        assert_eq!(discarded.len(), 1);
        assert_eq!(session.ledger().len(), 1);
        assert!(matches!(
            session.accept_raw_scan(&raw("SER001")).await,
            ScanOutcome::Duplicate { .. }
        ));
    }

    #[tokio::test]
    async fn test_clear_history_only_in_scan_only_mode() {
        let mut session = packaging_session(3).await;
        session.accept_raw_scan(&raw("SER001")).await;
        assert!(matches!(session.clear_history().await, Err(SessionError::HistoryLocked)));

        let config = SessionConfig::new(ShiftId::new("shift-2"), product(), 3).with_mode(SessionMode::ScanOnly);
        let (mut scan_only, _) = ShiftPackagingSession::open(config, collaborators(MockCaseCodeService::new()))
            .await
            .unwrap();
        let outcome = scan_only.accept_raw_scan(&raw("SER001")).await;
        assert!(matches!(outcome, ScanOutcome::Accepted { report: None, .. }));

        assert_eq!(scan_only.clear_history().await.unwrap(), 1);
        assert!(scan_only.ledger().is_empty());
        assert!(matches!(
            scan_only.initialize_box().await,
            Err(SessionError::NotPackaging { .. })
        ));
    }

    #[tokio::test]
    async fn test_confirm_scanned_case_rejects_bad_label() {
        let mut session = packaging_session(1).await;
        session.accept_raw_scan(&raw("SER001")).await;

        let err = session.confirm_scanned_case("not a label").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidCaseScan(_)));
    }
}
