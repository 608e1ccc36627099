use moka::future::Cache;
use std::sync::Arc;
use tracing::debug;

use crate::collaborators::{CaseCodeService, ReservationError};
use crate::types::{ProductId, Reservation, ShiftId};

/// Single-flight guard for case-code reservations, keyed by shift.
///
/// Concurrent initializers for the same shift share one in-flight
/// `reserve_next_case_code` call and all observe its result. A failed call
/// caches nothing, so the next initializer retries.
#[derive(Clone)]
pub struct ReservationGate {
    reservations: Cache<ShiftId, Reservation>,
}

impl Default for ReservationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationGate {
    pub fn new() -> Self {
        Self {
            reservations: Cache::builder().max_capacity(1024).build(),
        }
    }

    /// Return the shift's reservation, calling the service at most once
    /// across all concurrent callers
    pub async fn reserve(
        &self,
        shift_id: &ShiftId,
        product_id: &ProductId,
        service: &dyn CaseCodeService,
    ) -> Result<Reservation, ReservationError> {
        self.reservations
            .try_get_with(shift_id.clone(), async {
                debug!(shift_id = %shift_id, product_id = %product_id, "Reserving case code");
                service.reserve_next_case_code(shift_id, product_id).await
            })
            .await
            .map_err(|e: Arc<ReservationError>| (*e).clone())
    }

    pub async fn current(&self, shift_id: &ShiftId) -> Option<Reservation> {
        self.reservations.get(shift_id).await
    }

    /// Record the reservation handed out by a commit or restored from disk
    pub async fn replace(&self, shift_id: &ShiftId, reservation: Reservation) {
        self.reservations.insert(shift_id.clone(), reservation).await;
    }

    pub async fn release(&self, shift_id: &ShiftId) {
        self.reservations.invalidate(shift_id).await;
    }
}
