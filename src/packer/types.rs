use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::{CaseCode, UnitCode};
use crate::types::{Reservation, ReservationId, ShiftId};

/// Where the open box is in the reserve -> print -> verify -> commit cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackagingPhase {
    /// No case code reserved yet
    Idle,
    /// Accepting units into the open box
    Accumulating,
    /// Label print in flight
    AwaitingPrint,
    /// Label printed, waiting for the operator to verify the case
    AwaitingVerification,
    /// Commit in flight
    Committing,
}

impl PackagingPhase {
    /// Phases that require a reserved case code
    pub fn requires_reservation(self) -> bool {
        !matches!(self, PackagingPhase::Idle)
    }

    /// Phases with a collaborator call outstanding
    pub fn is_in_flight(self) -> bool {
        matches!(self, PackagingPhase::AwaitingPrint | PackagingPhase::Committing)
    }
}

impl fmt::Display for PackagingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackagingPhase::Idle => "idle",
            PackagingPhase::Accumulating => "accumulating",
            PackagingPhase::AwaitingPrint => "awaiting print",
            PackagingPhase::AwaitingVerification => "awaiting verification",
            PackagingPhase::Committing => "committing",
        };
        f.write_str(name)
    }
}

/// The open case of one shift
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxState {
    pub shift_id: ShiftId,
    pub reserved_case_code: Option<CaseCode>,
    pub reserved_case_id: Option<ReservationId>,
    pub item_count: u32,
    pub capacity: u32,
    pub member_unit_codes: Vec<UnitCode>,
    /// Incremented whenever the open box is committed or discarded, so
    /// ledger entries stamped with (case code, epoch) identify one box
    #[serde(default)]
    pub box_epoch: u64,
}

impl BoxState {
    pub fn new(shift_id: ShiftId, capacity: u32) -> Self {
        Self {
            shift_id,
            reserved_case_code: None,
            reserved_case_id: None,
            item_count: 0,
            capacity,
            member_unit_codes: Vec::new(),
            box_epoch: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.item_count >= self.capacity
    }

    pub fn reservation(&self) -> Option<Reservation> {
        match (&self.reserved_case_code, &self.reserved_case_id) {
            (Some(case_code), Some(reservation_id)) => Some(Reservation {
                case_code: case_code.clone(),
                reservation_id: reservation_id.clone(),
            }),
            _ => None,
        }
    }

    pub fn contains(&self, unit: &UnitCode) -> bool {
        let key = unit.dedup_key();
        self.member_unit_codes.iter().any(|m| m.dedup_key() == key)
    }

    pub(crate) fn set_reservation(&mut self, reservation: Reservation) {
        self.reserved_case_code = Some(reservation.case_code);
        self.reserved_case_id = Some(reservation.reservation_id);
    }

    pub(crate) fn empty_box(&mut self) -> Vec<UnitCode> {
        self.item_count = 0;
        self.box_epoch += 1;
        std::mem::take(&mut self.member_unit_codes)
    }
}

/// Result of accepting one unit into the open box
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptReport {
    pub item_count: u32,
    pub capacity: u32,
    pub case_code: CaseCode,
    pub box_full: bool,
}

/// Events driving `BoxLifecycle`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxEvent {
    Reserved { reservation: Reservation },
    UnitAccepted { unit: UnitCode },
    PrintRequested,
    PrintSucceeded,
    PrintFailed { reason: String },
    VerificationConfirmed,
    CommitSucceeded { next: Reservation },
    CommitFailed { reason: String },
    Cancelled,
    Cleared,
}

impl BoxEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BoxEvent::Reserved { .. } => "reserved",
            BoxEvent::UnitAccepted { .. } => "unit_accepted",
            BoxEvent::PrintRequested => "print_requested",
            BoxEvent::PrintSucceeded => "print_succeeded",
            BoxEvent::PrintFailed { .. } => "print_failed",
            BoxEvent::VerificationConfirmed => "verification_confirmed",
            BoxEvent::CommitSucceeded { .. } => "commit_succeeded",
            BoxEvent::CommitFailed { .. } => "commit_failed",
            BoxEvent::Cancelled => "cancelled",
            BoxEvent::Cleared => "cleared",
        }
    }
}

/// Audit record of one accepted transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxTransitionRecord {
    pub from: PackagingPhase,
    pub to: PackagingPhase,
    pub event: String,
    pub case_code: Option<CaseCode>,
    pub item_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of the packer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxStatus {
    pub phase: PackagingPhase,
    pub box_state: BoxState,
}

impl BoxStatus {
    pub fn box_full(&self) -> bool {
        self.box_state.is_full()
    }
}
