use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use super::DecodeError;

/// Length of an SSCC including its check digit
pub const SSCC_LENGTH: usize = 18;

// AIM symbology identifier, e.g. "]C1" (GS1-128), "]d2" (DataMatrix), "]Q3" (QR)
static SYMBOLOGY_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\][A-Za-z][0-9A-Za-z]").expect("symbology pattern is valid"));

static DIGIT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("digit run pattern is valid"));

/// Serial Shipping Container Code identifying one case
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CaseCode {
    value: String,
}

impl CaseCode {
    /// Accept exactly 18 digits carrying a valid GS1 check digit
    pub fn parse(value: &str) -> Result<Self, DecodeError> {
        if value.len() != SSCC_LENGTH || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DecodeError::invalid(format!(
                "case code must be {SSCC_LENGTH} digits, got {value:?}"
            )));
        }

        let (body, check) = value.split_at(SSCC_LENGTH - 1);
        let expected = compute_case_check_digit(body)
            .ok_or_else(|| DecodeError::invalid("case code body is not numeric"))?;
        let found = check.as_bytes()[0] - b'0';
        if expected != found {
            return Err(DecodeError::CheckDigitMismatch {
                value: value.to_string(),
                expected,
                found,
            });
        }

        Ok(Self {
            value: value.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// SSCC extension digit (first digit)
    pub fn extension_digit(&self) -> u8 {
        self.value.as_bytes()[0] - b'0'
    }

    /// Human-readable form with the (00) application identifier
    pub fn to_element_string(&self) -> String {
        format!("(00){}", self.value)
    }
}

impl fmt::Display for CaseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl TryFrom<String> for CaseCode {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CaseCode::parse(&value)
    }
}

impl From<CaseCode> for String {
    fn from(code: CaseCode) -> Self {
        code.value
    }
}

/// GS1 mod-10 check digit for a numeric body.
///
/// Weights alternate 3, 1, 3, ... starting from the rightmost body digit.
/// Returns `None` if the body is empty or contains a non-digit.
pub fn compute_case_check_digit(body: &str) -> Option<u8> {
    if body.is_empty() {
        return None;
    }

    let mut sum: u32 = 0;
    for (position, byte) in body.bytes().rev().enumerate() {
        if !byte.is_ascii_digit() {
            return None;
        }
        let digit = u32::from(byte - b'0');
        let weight = if position % 2 == 0 { 3 } else { 1 };
        sum += digit * weight;
    }

    Some(((10 - sum % 10) % 10) as u8)
}

/// True if `code` is 18 digits whose last digit equals the recomputed check digit
pub fn validate_case_check_digit(code: &str) -> bool {
    if code.len() != SSCC_LENGTH {
        return false;
    }
    let (body, check) = code.split_at(SSCC_LENGTH - 1);
    match (compute_case_check_digit(body), check.bytes().next()) {
        (Some(expected), Some(found)) if found.is_ascii_digit() => expected == found - b'0',
        _ => false,
    }
}

/// Normalize a raw case scan into a case code.
///
/// Strips the symbology identifier and surrounding control bytes, then takes
/// the last run of digits. A run of 18 digits is the SSCC itself; a run of 20
/// starting with the (00) application identifier is accepted as well.
pub fn normalize_case(raw: &str) -> Result<CaseCode, DecodeError> {
    let trimmed = raw.trim_matches(|c: char| c.is_whitespace() || c.is_control());
    let without_prefix = SYMBOLOGY_PREFIX.replace(trimmed, "");

    let run = DIGIT_RUN
        .find_iter(&without_prefix)
        .last()
        .map(|m| m.as_str())
        .ok_or_else(|| DecodeError::invalid("no digits in case scan"))?;

    let body = match run.len() {
        SSCC_LENGTH => run,
        20 if run.starts_with("00") => &run[2..],
        other => {
            return Err(DecodeError::invalid(format!(
                "expected an {SSCC_LENGTH}-digit SSCC, found {other} digits"
            )))
        }
    };

    CaseCode::parse(body)
}
