use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use super::DecodeError;

/// ASCII group separator (FNC1 as transmitted by most 2D scanners)
pub const GROUP_SEPARATOR: char = '\u{1d}';

// Fixed-width layout: 01 + 14-digit GTIN + 21 + country digit + 6-char serial,
// an optional GS, then 93 + 4-char verification code. Nothing else allowed.
static STRICT_UNIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^01(\d{14})21(\d)([\x21-\x7E]{6})\x1D?93([\x21-\x7E]{4})$")
        .expect("strict unit pattern is valid")
});

// Recovering layout: unanchored, so symbology prefixes and trailing CR/LF are
// skipped, and the separator may arrive as any run of control bytes, spaces,
// or the literal "<GS>" some keyboard-wedge scanners emit.
static RECOVERING_UNIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"01(\d{14})21(\d)([\x21-\x7E]{6})(?:[\x00-\x20\x7F]|<GS>)*93([\x21-\x7E]{4})")
        .expect("recovering unit pattern is valid")
});

/// Identity of one scanned product unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitCode {
    pub gtin: String,
    pub country_code: String,
    pub serial_number: String,
    pub verification_code: String,
    pub raw_data: String,
}

impl UnitCode {
    /// Key used for uniqueness checks: GTIN + country + serial.
    ///
    /// The verification code and the raw bytes are deliberately left out so
    /// the same physical unit read through different scanner settings still
    /// collides.
    pub fn dedup_key(&self) -> String {
        format!("{}{}{}", self.gtin, self.country_code, self.serial_number)
    }

    /// Canonical GS1 element string for this unit
    pub fn to_gs1_payload(&self) -> String {
        format!(
            "01{}21{}{}{}93{}",
            self.gtin, self.country_code, self.serial_number, GROUP_SEPARATOR, self.verification_code
        )
    }
}

impl fmt::Display for UnitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(01){}(21){}{}(93){}",
            self.gtin, self.country_code, self.serial_number, self.verification_code
        )
    }
}

/// Decode a raw scan into a unit code.
///
/// The strict fixed-width layout is tried first; if it does not match, the
/// recovering pattern is searched for inside the raw string.
pub fn decode_unit(raw: &str) -> Result<UnitCode, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::invalid("empty scan"));
    }

    let captures = STRICT_UNIT_PATTERN
        .captures(raw)
        .or_else(|| RECOVERING_UNIT_PATTERN.captures(raw))
        .ok_or_else(|| DecodeError::invalid("not a GS1 unit code"))?;

    Ok(UnitCode {
        gtin: captures[1].to_string(),
        country_code: captures[2].to_string(),
        serial_number: captures[3].to_string(),
        verification_code: captures[4].to_string(),
        raw_data: raw.to_string(),
    })
}

/// Numeric GTIN comparison that ignores non-digit noise and leading zeros
pub fn matches_product(unit: &UnitCode, expected_gtin: &str) -> bool {
    match (numeric_gtin(&unit.gtin), numeric_gtin(expected_gtin)) {
        (Some(scanned), Some(expected)) => scanned == expected,
        _ => false,
    }
}

fn numeric_gtin(value: &str) -> Option<u64> {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.len() > 18 {
        return None;
    }
    digits.parse().ok()
}
