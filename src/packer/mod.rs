// Box Packer - drives one shift's open case through
// reserve -> accumulate -> print -> verify -> commit.
//
// Transitions live in `BoxLifecycle`; this layer talks to the case-code
// service and the label printer. Print and commit come in two halves
// (`begin_*` / `complete_*`) so a caller can run the collaborator call
// elsewhere and feed the outcome back.

pub mod gate;
pub mod state_machine;
pub mod types;

use chrono::{Local, NaiveDate};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::codec::{CaseCode, UnitCode};
use crate::collaborators::{
    CaseCodeService, CommitError, CommitRequest, LabelPayload, LabelPrinter, PrintError, ReservationError,
};
use crate::types::{ProductId, ProductInfo, Reservation, ShiftId};

pub use gate::ReservationGate;
pub use state_machine::BoxLifecycle;
pub use types::{AcceptReport, BoxEvent, BoxState, BoxStatus, BoxTransitionRecord, PackagingPhase};

#[derive(Debug, Error)]
pub enum PackerError {
    #[error("Box packer for shift {shift_id} is not initialized")]
    NotInitialized { shift_id: ShiftId },

    #[error("Packer belongs to shift {expected}, got {actual}")]
    ShiftMismatch { expected: ShiftId, actual: ShiftId },

    #[error("Packer packs product {expected}, got {actual}")]
    ProductMismatch { expected: ProductId, actual: ProductId },

    #[error("Box is not accepting scans while {phase}")]
    BoxNotAcceptingScans { phase: PackagingPhase },

    #[error("Box is full ({capacity} units)")]
    BoxFull { capacity: u32 },

    #[error("Box holds {item_count} of {capacity} units")]
    BoxNotFull { item_count: u32, capacity: u32 },

    #[error("Unit {unit} is already in the open box")]
    AlreadyInBox { unit: String },

    #[error("Case code {actual} does not match reserved case code {expected}")]
    CaseCodeMismatch { expected: CaseCode, actual: CaseCode },

    #[error("Member list does not match the open box ({expected} units in box, {actual} given)")]
    MembershipMismatch { expected: usize, actual: usize },

    #[error("Invalid transition: {event} not allowed while {phase}")]
    InvalidTransition { phase: PackagingPhase, event: String },

    #[error("Box capacity must be at least 1")]
    InvalidCapacity,

    #[error("Capacity {capacity} is locked while the box holds {item_count} units")]
    CapacityLocked { capacity: u32, item_count: u32 },

    #[error("Inconsistent box state: {reason}")]
    CorruptState { reason: String },

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Print(#[from] PrintError),

    #[error(transparent)]
    Commit(#[from] CommitError),
}

/// A case the backend accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBox {
    pub case_code: CaseCode,
    pub unit_codes: Vec<UnitCode>,
    pub next: Reservation,
}

pub struct BoxPacker {
    product: ProductInfo,
    planned_date: NaiveDate,
    lifecycle: BoxLifecycle,
    case_codes: Arc<dyn CaseCodeService>,
    printer: Arc<dyn LabelPrinter>,
    gate: ReservationGate,
}

impl std::fmt::Debug for BoxPacker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxPacker")
            .field("product", &self.product.id)
            .field("planned_date", &self.planned_date)
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

impl BoxPacker {
    pub fn new(
        shift_id: ShiftId,
        product: ProductInfo,
        capacity: u32,
        case_codes: Arc<dyn CaseCodeService>,
        printer: Arc<dyn LabelPrinter>,
    ) -> Self {
        Self {
            product,
            planned_date: Local::now().date_naive(),
            lifecycle: BoxLifecycle::new(shift_id, capacity),
            case_codes,
            printer,
            gate: ReservationGate::new(),
        }
    }

    /// Share a reservation gate with other packers of the same station
    pub fn with_gate(mut self, gate: ReservationGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_planned_date(mut self, planned_date: NaiveDate) -> Self {
        self.planned_date = planned_date;
        self
    }

    pub fn shift_id(&self) -> &ShiftId {
        &self.lifecycle.state().shift_id
    }

    pub fn product(&self) -> &ProductInfo {
        &self.product
    }

    pub fn phase(&self) -> PackagingPhase {
        self.lifecycle.phase()
    }

    pub fn box_state(&self) -> &BoxState {
        self.lifecycle.state()
    }

    pub fn history(&self) -> impl Iterator<Item = &BoxTransitionRecord> {
        self.lifecycle.history()
    }

    pub fn status(&self) -> BoxStatus {
        BoxStatus {
            phase: self.lifecycle.phase(),
            box_state: self.lifecycle.state().clone(),
        }
    }

    pub fn printer(&self) -> Arc<dyn LabelPrinter> {
        Arc::clone(&self.printer)
    }

    pub fn case_codes(&self) -> Arc<dyn CaseCodeService> {
        Arc::clone(&self.case_codes)
    }

    /// Reserve the shift's first case code. Idempotent: once a reservation
    /// is held the existing case code is returned without calling the
    /// service again.
    pub async fn initialize(
        &mut self,
        shift_id: &ShiftId,
        product_id: &ProductId,
        capacity: u32,
    ) -> Result<CaseCode, PackerError> {
        self.check_shift(shift_id)?;
        if *product_id != self.product.id {
            return Err(PackerError::ProductMismatch {
                expected: self.product.id.clone(),
                actual: product_id.clone(),
            });
        }

        if let Some(case_code) = self.lifecycle.state().reserved_case_code.clone() {
            if let Err(e) = self.lifecycle.set_capacity(capacity) {
                warn!(
                    shift_id = %shift_id,
                    requested = capacity,
                    error = %e,
                    "Keeping current box capacity"
                );
            }
            return Ok(case_code);
        }

        self.lifecycle.set_capacity(capacity)?;
        let reservation = self
            .gate
            .reserve(shift_id, product_id, self.case_codes.as_ref())
            .await?;
        let case_code = reservation.case_code.clone();
        self.lifecycle.handle_event(BoxEvent::Reserved { reservation })?;

        info!(
            shift_id = %shift_id,
            case_code = %case_code,
            capacity,
            "Box packer initialized"
        );
        Ok(case_code)
    }

    /// Whether a unit could be accepted right now, without mutating anything
    pub fn can_accept(&self) -> Result<(), PackerError> {
        match self.lifecycle.phase() {
            PackagingPhase::Idle => Err(self.not_initialized()),
            PackagingPhase::Accumulating if self.lifecycle.state().is_full() => Err(PackerError::BoxFull {
                capacity: self.lifecycle.state().capacity,
            }),
            PackagingPhase::Accumulating => Ok(()),
            phase => Err(PackerError::BoxNotAcceptingScans { phase }),
        }
    }

    pub fn accept_unit(&mut self, unit: UnitCode) -> Result<AcceptReport, PackerError> {
        if self.lifecycle.phase() == PackagingPhase::Idle {
            return Err(self.not_initialized());
        }
        self.lifecycle.handle_event(BoxEvent::UnitAccepted { unit })?;

        let state = self.lifecycle.state();
        let case_code = state
            .reserved_case_code
            .clone()
            .ok_or_else(|| self.not_initialized())?;
        Ok(AcceptReport {
            item_count: state.item_count,
            capacity: state.capacity,
            case_code,
            box_full: state.is_full(),
        })
    }

    /// Move a full box to `AwaitingPrint` and build its label
    pub fn begin_print(&mut self, case_code: &CaseCode, members: &[UnitCode]) -> Result<LabelPayload, PackerError> {
        self.verify_box(case_code, members)?;
        self.lifecycle.handle_event(BoxEvent::PrintRequested)?;

        let state = self.lifecycle.state();
        Ok(LabelPayload::new(
            case_code.clone(),
            self.product.clone(),
            self.planned_date,
            state.capacity,
            state.item_count,
        ))
    }

    /// Feed the printer's answer back. A failure returns the box to
    /// `Accumulating` with reservation and members intact.
    pub fn complete_print(&mut self, result: Result<(), PrintError>) -> Result<(), PackerError> {
        match result {
            Ok(()) => {
                self.lifecycle.handle_event(BoxEvent::PrintSucceeded)?;
                Ok(())
            }
            Err(e) => {
                self.lifecycle.handle_event(BoxEvent::PrintFailed { reason: e.to_string() })?;
                warn!(shift_id = %self.shift_id(), error = %e, "Label print failed");
                Err(PackerError::Print(e))
            }
        }
    }

    pub async fn request_print_and_verify(
        &mut self,
        case_code: &CaseCode,
        members: &[UnitCode],
    ) -> Result<(), PackerError> {
        let label = self.begin_print(case_code, members)?;
        let printer = self.printer();
        let result = printer.print(&label).await;
        self.complete_print(result)
    }

    /// Validate the operator's confirmation and move to `Committing`.
    /// A mismatched case code or member list changes nothing.
    pub fn begin_commit(&mut self, case_code: &CaseCode, members: &[UnitCode]) -> Result<CommitRequest, PackerError> {
        self.verify_box(case_code, members)?;
        self.lifecycle.handle_event(BoxEvent::VerificationConfirmed)?;

        let state = self.lifecycle.state();
        let reservation_id = state
            .reserved_case_id
            .clone()
            .ok_or_else(|| self.not_initialized())?;
        Ok(CommitRequest {
            reservation_id,
            case_code: case_code.clone(),
            shift_id: state.shift_id.clone(),
            product_id: self.product.id.clone(),
            unit_codes: state.member_unit_codes.clone(),
        })
    }

    /// Feed the backend's answer back. Success empties the box and adopts the
    /// next reservation; failure returns to `AwaitingVerification`.
    pub async fn complete_commit(
        &mut self,
        result: Result<Reservation, CommitError>,
    ) -> Result<CommittedBox, PackerError> {
        let state = self.lifecycle.state();
        let case_code = state
            .reserved_case_code
            .clone()
            .ok_or_else(|| self.not_initialized())?;
        let unit_codes = state.member_unit_codes.clone();

        match result {
            Ok(next) => {
                self.lifecycle
                    .handle_event(BoxEvent::CommitSucceeded { next: next.clone() })?;
                self.gate.replace(&self.lifecycle.state().shift_id, next.clone()).await;

                info!(
                    shift_id = %self.shift_id(),
                    case_code = %case_code,
                    units = unit_codes.len(),
                    next_case_code = %next.case_code,
                    "Case committed"
                );
                Ok(CommittedBox {
                    case_code,
                    unit_codes,
                    next,
                })
            }
            Err(e) => {
                self.lifecycle
                    .handle_event(BoxEvent::CommitFailed { reason: e.to_string() })?;
                warn!(
                    shift_id = %self.shift_id(),
                    case_code = %case_code,
                    error = %e,
                    "Case commit failed, reservation kept"
                );
                Err(PackerError::Commit(e))
            }
        }
    }

    pub async fn confirm_verification(
        &mut self,
        case_code: &CaseCode,
        members: &[UnitCode],
    ) -> Result<CommittedBox, PackerError> {
        let request = self.begin_commit(case_code, members)?;
        let service = self.case_codes();
        let result = service.commit_packed_case(&request).await;
        self.complete_commit(result).await
    }

    /// Discard the open box's members, keeping the reserved case code.
    /// Returns the discarded units.
    pub fn cancel_current_box(&mut self) -> Result<Vec<UnitCode>, PackerError> {
        if self.lifecycle.phase() == PackagingPhase::Idle {
            return Err(self.not_initialized());
        }
        let members = self.lifecycle.state().member_unit_codes.clone();
        self.lifecycle.handle_event(BoxEvent::Cancelled)?;

        info!(
            shift_id = %self.shift_id(),
            discarded = members.len(),
            "Open box cancelled"
        );
        Ok(members)
    }

    /// Drop the reservation and the open box; the next `initialize` reserves
    /// a fresh case code
    pub async fn clear(&mut self) -> Result<Vec<UnitCode>, PackerError> {
        let members = self.lifecycle.state().member_unit_codes.clone();
        self.lifecycle.handle_event(BoxEvent::Cleared)?;
        self.gate.release(&self.lifecycle.state().shift_id).await;
        Ok(members)
    }

    /// Replace the lifecycle with one rebuilt from a snapshot
    pub async fn restore(&mut self, lifecycle: BoxLifecycle) -> Result<(), PackerError> {
        self.check_shift(&lifecycle.state().shift_id)?;
        if let Some(reservation) = lifecycle.state().reservation() {
            self.gate.replace(&lifecycle.state().shift_id, reservation).await;
        }

        info!(
            shift_id = %self.shift_id(),
            phase = %lifecycle.phase(),
            item_count = lifecycle.state().item_count,
            "Box state restored"
        );
        self.lifecycle = lifecycle;
        Ok(())
    }

    /// Re-add units the ledger recorded for the open box but the box itself
    /// lost. Stops at capacity; returns how many were added.
    pub fn adopt_units(&mut self, units: impl IntoIterator<Item = UnitCode>) -> usize {
        if self.lifecycle.phase() != PackagingPhase::Accumulating {
            return 0;
        }

        let mut adopted = 0;
        for unit in units {
            if self.lifecycle.state().is_full() {
                break;
            }
            if self.lifecycle.state().contains(&unit) {
                continue;
            }
            if self.lifecycle.handle_event(BoxEvent::UnitAccepted { unit }).is_ok() {
                adopted += 1;
            }
        }
        if adopted > 0 {
            info!(shift_id = %self.shift_id(), adopted, "Adopted orphaned units into open box");
        }
        adopted
    }

    fn check_shift(&self, shift_id: &ShiftId) -> Result<(), PackerError> {
        let own = &self.lifecycle.state().shift_id;
        if own != shift_id {
            return Err(PackerError::ShiftMismatch {
                expected: own.clone(),
                actual: shift_id.clone(),
            });
        }
        Ok(())
    }

    fn verify_box(&self, case_code: &CaseCode, members: &[UnitCode]) -> Result<(), PackerError> {
        let state = self.lifecycle.state();
        let reserved = state
            .reserved_case_code
            .as_ref()
            .ok_or_else(|| self.not_initialized())?;
        if reserved != case_code {
            return Err(PackerError::CaseCodeMismatch {
                expected: reserved.clone(),
                actual: case_code.clone(),
            });
        }

        let mut expected: Vec<String> = state.member_unit_codes.iter().map(UnitCode::dedup_key).collect();
        let mut given: Vec<String> = members.iter().map(UnitCode::dedup_key).collect();
        expected.sort();
        given.sort();
        if expected != given {
            return Err(PackerError::MembershipMismatch {
                expected: expected.len(),
                actual: given.len(),
            });
        }
        Ok(())
    }

    fn not_initialized(&self) -> PackerError {
        PackerError::NotInitialized {
            shift_id: self.lifecycle.state().shift_id.clone(),
        }
    }
}
