// Code Codec - pure parsing and validation of scanned marking codes
//
// Unit codes are GS1 DataMatrix payloads (GTIN + country + serial + check),
// case codes are 18-digit SSCCs. Nothing in here performs I/O and every
// function returns a typed failure instead of panicking on bad input.

pub mod case;
pub mod unit;

use thiserror::Error;

pub use case::{compute_case_check_digit, normalize_case, validate_case_check_digit, CaseCode};
pub use unit::{decode_unit, matches_product, UnitCode, GROUP_SEPARATOR};

/// Errors produced while decoding raw scanner input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Invalid code format: {reason}")]
    InvalidFormat { reason: String },

    #[error("Check digit mismatch for case code {value}: expected {expected}, found {found}")]
    CheckDigitMismatch {
        value: String,
        expected: u8,
        found: u8,
    },
}

impl DecodeError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        DecodeError::InvalidFormat {
            reason: reason.into(),
        }
    }
}
