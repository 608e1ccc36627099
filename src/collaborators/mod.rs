// External collaborator contracts consumed by the packer
//
// The case-code backend and the label printer are injected as trait objects
// so the packing core can be exercised without network or device access.

pub mod local;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::codec::{CaseCode, DecodeError, UnitCode};
use crate::types::{ProductId, ProductInfo, Reservation, ReservationId, ShiftId};

pub use local::{LocalCaseCodeService, SpoolLabelPrinter};

/// Case-code service could not hand out a reservation
#[derive(Debug, Clone, Error)]
pub enum ReservationError {
    #[error("Case code service unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Reservation rejected: {reason}")]
    Rejected { reason: String },

    #[error("Case code service returned an invalid case code: {0}")]
    InvalidCaseCode(#[from] DecodeError),
}

/// Label could not be printed
#[derive(Debug, Clone, Error)]
pub enum PrintError {
    #[error("Printer unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Print failed: {reason}")]
    Failed { reason: String },
}

/// Backend refused or never acknowledged a packed case
#[derive(Debug, Clone, Error)]
pub enum CommitError {
    #[error("Case code service unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Commit rejected: {reason}")]
    Rejected { reason: String },
}

/// Everything the backend needs to record one packed case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub reservation_id: ReservationId,
    pub case_code: CaseCode,
    pub shift_id: ShiftId,
    pub product_id: ProductId,
    pub unit_codes: Vec<UnitCode>,
}

/// Data printed on a case label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelPayload {
    pub case_code: CaseCode,
    pub product: ProductInfo,
    pub planned_date: NaiveDate,
    pub expiration_date: NaiveDate,
    pub capacity: u32,
    pub item_count: u32,
}

impl LabelPayload {
    pub fn new(case_code: CaseCode, product: ProductInfo, planned_date: NaiveDate, capacity: u32, item_count: u32) -> Self {
        let expiration_date = product.expiration_date(planned_date);
        Self {
            case_code,
            product,
            planned_date,
            expiration_date,
            capacity,
            item_count,
        }
    }
}

/// Backend that reserves case codes and records packed cases
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CaseCodeService: Send + Sync {
    /// Reserve the next case code for a shift's product
    async fn reserve_next_case_code(
        &self,
        shift_id: &ShiftId,
        product_id: &ProductId,
    ) -> Result<Reservation, ReservationError>;

    /// Commit a packed case and hand out the next reservation
    async fn commit_packed_case(&self, request: &CommitRequest) -> Result<Reservation, CommitError>;
}

/// Case label printer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LabelPrinter: Send + Sync {
    async fn print(&self, label: &LabelPayload) -> Result<(), PrintError>;
}
