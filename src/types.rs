// Identifiers and value types shared by the ledger, packer and session

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::CaseCode;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }
    };
}

string_id!(
    /// Production shift identifier; every ledger and box belongs to one shift
    ShiftId
);
string_id!(
    /// Product identifier as known to the backend
    ProductId
);
string_id!(
    /// Backend handle for a reserved case code
    ReservationId
);

/// A case code reserved on the backend, consumed exactly once by a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub case_code: CaseCode,
    pub reservation_id: ReservationId,
}

/// Product metadata needed for product matching and case labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub id: ProductId,
    pub name: String,
    pub gtin: String,
    pub expiration_in_days: u32,
}

impl ProductInfo {
    pub fn expiration_date(&self, planned_date: NaiveDate) -> NaiveDate {
        planned_date + Duration::days(i64::from(self.expiration_in_days))
    }
}
