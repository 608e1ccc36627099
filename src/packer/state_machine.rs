use chrono::Utc;
use std::collections::VecDeque;
use tracing::{debug, error, info};

use super::types::{BoxEvent, BoxState, BoxTransitionRecord, PackagingPhase};
use super::PackerError;
use crate::types::ShiftId;

const MAX_HISTORY: usize = 256;

/// Pure transition core of the box packer.
///
/// Owns the phase and the open box. Collaborator calls happen outside; their
/// outcomes come back in as events, so every mutation of the box goes
/// through `handle_event`.
#[derive(Debug, Clone)]
pub struct BoxLifecycle {
    phase: PackagingPhase,
    state: BoxState,
    history: VecDeque<BoxTransitionRecord>,
}

impl BoxLifecycle {
    pub fn new(shift_id: ShiftId, capacity: u32) -> Self {
        Self {
            phase: PackagingPhase::Idle,
            state: BoxState::new(shift_id, capacity),
            history: VecDeque::new(),
        }
    }

    /// Rebuild a lifecycle from a persisted phase and box.
    ///
    /// A phase with a collaborator call in flight cannot survive a restart:
    /// an unfinished print falls back to accumulating and an unfinished
    /// commit falls back to awaiting verification so the operator confirms
    /// again. The commit is idempotent per reservation on the backend side.
    pub fn restore(phase: PackagingPhase, state: BoxState) -> Result<Self, PackerError> {
        let phase = match phase {
            PackagingPhase::AwaitingPrint => PackagingPhase::Accumulating,
            PackagingPhase::Committing => PackagingPhase::AwaitingVerification,
            other => other,
        };

        if phase.requires_reservation() && state.reservation().is_none() {
            return Err(PackerError::CorruptState {
                reason: format!("phase {phase} without a reserved case code"),
            });
        }
        if state.capacity == 0 {
            return Err(PackerError::InvalidCapacity);
        }
        if state.item_count as usize != state.member_unit_codes.len() {
            return Err(PackerError::CorruptState {
                reason: format!(
                    "item count {} does not match {} members",
                    state.item_count,
                    state.member_unit_codes.len()
                ),
            });
        }
        if state.item_count > state.capacity {
            return Err(PackerError::CorruptState {
                reason: format!("item count {} exceeds capacity {}", state.item_count, state.capacity),
            });
        }
        if phase == PackagingPhase::AwaitingVerification && !state.is_full() {
            return Err(PackerError::CorruptState {
                reason: "awaiting verification with a partial box".to_string(),
            });
        }

        Ok(Self {
            phase,
            state,
            history: VecDeque::new(),
        })
    }

    pub fn phase(&self) -> PackagingPhase {
        self.phase
    }

    pub fn state(&self) -> &BoxState {
        &self.state
    }

    pub fn history(&self) -> impl Iterator<Item = &BoxTransitionRecord> {
        self.history.iter()
    }

    /// Capacity can only change while the open box is empty
    pub fn set_capacity(&mut self, capacity: u32) -> Result<(), PackerError> {
        if capacity == 0 {
            return Err(PackerError::InvalidCapacity);
        }
        if self.state.item_count > 0 && capacity != self.state.capacity {
            return Err(PackerError::CapacityLocked {
                capacity: self.state.capacity,
                item_count: self.state.item_count,
            });
        }
        self.state.capacity = capacity;
        Ok(())
    }

    /// Apply one event. On error the lifecycle is left untouched.
    pub fn handle_event(&mut self, event: BoxEvent) -> Result<PackagingPhase, PackerError> {
        let from = self.phase;

        let to = match (self.phase, &event) {
            (PackagingPhase::Idle, BoxEvent::Reserved { reservation }) => {
                self.state.set_reservation(reservation.clone());
                self.state.item_count = 0;
                self.state.member_unit_codes.clear();
                PackagingPhase::Accumulating
            }

            (PackagingPhase::Accumulating, BoxEvent::UnitAccepted { unit }) => {
                if self.state.is_full() {
                    return Err(PackerError::BoxFull {
                        capacity: self.state.capacity,
                    });
                }
                if self.state.contains(unit) {
                    return Err(PackerError::AlreadyInBox {
                        unit: unit.dedup_key(),
                    });
                }
                self.state.member_unit_codes.push(unit.clone());
                self.state.item_count += 1;
                PackagingPhase::Accumulating
            }
            (phase, BoxEvent::UnitAccepted { .. }) => {
                return Err(PackerError::BoxNotAcceptingScans { phase });
            }

            (PackagingPhase::Accumulating, BoxEvent::PrintRequested) => {
                if !self.state.is_full() {
                    return Err(PackerError::BoxNotFull {
                        item_count: self.state.item_count,
                        capacity: self.state.capacity,
                    });
                }
                PackagingPhase::AwaitingPrint
            }
            (PackagingPhase::AwaitingPrint, BoxEvent::PrintSucceeded) => PackagingPhase::AwaitingVerification,
            (PackagingPhase::AwaitingPrint, BoxEvent::PrintFailed { .. }) => PackagingPhase::Accumulating,

            (PackagingPhase::AwaitingVerification, BoxEvent::VerificationConfirmed) => PackagingPhase::Committing,
            (PackagingPhase::Committing, BoxEvent::CommitSucceeded { next }) => {
                self.state.empty_box();
                self.state.set_reservation(next.clone());
                PackagingPhase::Accumulating
            }
            (PackagingPhase::Committing, BoxEvent::CommitFailed { .. }) => PackagingPhase::AwaitingVerification,

            (PackagingPhase::Accumulating | PackagingPhase::AwaitingVerification, BoxEvent::Cancelled) => {
                self.state.empty_box();
                PackagingPhase::Accumulating
            }

            (PackagingPhase::Idle | PackagingPhase::Accumulating | PackagingPhase::AwaitingVerification, BoxEvent::Cleared) => {
                self.state.empty_box();
                self.state.reserved_case_code = None;
                self.state.reserved_case_id = None;
                PackagingPhase::Idle
            }

            (phase, event) => {
                error!(
                    phase = %phase,
                    event = event.name(),
                    shift_id = %self.state.shift_id,
                    "Invalid box transition"
                );
                return Err(PackerError::InvalidTransition {
                    phase,
                    event: event.name().to_string(),
                });
            }
        };

        self.phase = to;
        self.record_transition(from, to, &event);
        Ok(to)
    }

    fn record_transition(&mut self, from: PackagingPhase, to: PackagingPhase, event: &BoxEvent) {
        let record = BoxTransitionRecord {
            from,
            to,
            event: event.name().to_string(),
            case_code: self.state.reserved_case_code.clone(),
            item_count: self.state.item_count,
            timestamp: Utc::now(),
        };

        if from == to {
            debug!(
                phase = %to,
                event = %record.event,
                item_count = record.item_count,
                "Box updated"
            );
        } else {
            info!(
                from = %from,
                to = %to,
                event = %record.event,
                case_code = ?record.case_code.as_ref().map(|c| c.as_str()),
                item_count = record.item_count,
                "Box state transition"
            );
        }

        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }
}
