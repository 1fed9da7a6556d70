//! Identifier offset arithmetic
//!
//! Numeric identifiers are arbitrary precision. Indexed fields store the
//! digit count as a two-digit prefix: record `73` is stored as `0273`.

use std::fmt;

use rsa::BigUint;
use tracing::{debug, info};

use crate::error::{KraError, Result};

/// Largest digit count an indexed field can carry
pub const MAX_INDEXED_DIGITS: usize = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetMode {
    Append,
    Remove,
}

/// Offset added to or removed from every identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdOffset {
    pub mode: OffsetMode,
    pub offset: BigUint,
}

impl IdOffset {
    pub fn append(offset: BigUint) -> Self {
        IdOffset {
            mode: OffsetMode::Append,
            offset,
        }
    }

    pub fn remove(offset: BigUint) -> Self {
        IdOffset {
            mode: OffsetMode::Remove,
            offset,
        }
    }

    /// Parse a decimal offset
    pub fn parse(mode: OffsetMode, digits: &str) -> Result<Self> {
        let offset = parse_decimal(digits).ok_or_else(|| {
            KraError::InvalidConfig(format!("ID offset '{}' is not a decimal number", digits))
        })?;
        Ok(IdOffset { mode, offset })
    }
}

impl fmt::Display for IdOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            OffsetMode::Append => write!(f, "+{}", self.offset),
            OffsetMode::Remove => write!(f, "-{}", self.offset),
        }
    }
}

fn is_decimal(data: &str) -> bool {
    !data.is_empty() && data.bytes().all(|b| b.is_ascii_digit())
}

fn parse_decimal(data: &str) -> Option<BigUint> {
    if is_decimal(data) {
        BigUint::parse_bytes(data.as_bytes(), 10)
    } else {
        None
    }
}

/// Encode `value` with its two-digit length prefix
pub fn indexed_to_db(value: &BigUint) -> Result<String> {
    let digits = value.to_string();
    if digits.len() > MAX_INDEXED_DIGITS {
        return Err(KraError::IndexedOverflow {
            digits: digits.len(),
            limit: MAX_INDEXED_DIGITS,
        });
    }
    Ok(format!("{:02}{}", digits.len(), digits))
}

/// Decode an indexed value, checking the prefix against the digit count
pub fn indexed_from_db(data: &str) -> Result<BigUint> {
    let invalid = || KraError::InvalidIndexedValue(data.to_string());

    if data.len() < 3 || !is_decimal(data) {
        return Err(invalid());
    }
    let (prefix, digits) = data.split_at(2);
    let count: usize = prefix.parse().map_err(|_| invalid())?;
    if count == 0 || count != digits.len() {
        return Err(invalid());
    }
    parse_decimal(digits).ok_or_else(invalid)
}

/// Apply `id_offset` to `value`
///
/// Append requires the offset to be strictly greater than the value; remove
/// requires the offset not to exceed it.
pub fn apply_offset(attribute: &str, value: &BigUint, id_offset: &IdOffset) -> Result<BigUint> {
    match id_offset.mode {
        OffsetMode::Append => {
            if id_offset.offset > *value {
                Ok(value + &id_offset.offset)
            } else {
                Err(KraError::OffsetPolicyViolation {
                    attribute: attribute.to_string(),
                    value: value.to_string(),
                    offset: id_offset.offset.to_string(),
                })
            }
        }
        OffsetMode::Remove => {
            if id_offset.offset <= *value {
                Ok(value - &id_offset.offset)
            } else {
                Err(KraError::OffsetUnderflow {
                    attribute: attribute.to_string(),
                    value: value.to_string(),
                    offset: id_offset.offset.to_string(),
                })
            }
        }
    }
}

/// Rewrite the numeric value of `line`
///
/// The value is everything after `attribute` and one separator character.
/// The rewritten line is `attribute + delimiter + value`. Lines whose value
/// is not numeric, or runs without an offset, are returned unchanged. An
/// indexed value with a bad length prefix fails with
/// [`KraError::InvalidIndexedValue`].
pub fn compose_numeric_line(
    attribute: &str,
    delimiter: &str,
    line: &str,
    indexed: bool,
    id_offset: Option<&IdOffset>,
) -> Result<String> {
    let Some(id_offset) = id_offset else {
        return Ok(line.to_string());
    };

    let data = line.get(attribute.len() + 1..).unwrap_or("").trim();
    if !is_decimal(data) {
        info!(line = %line, "skipped changing non-numeric line");
        return Ok(line.to_string());
    }

    let value = if indexed {
        indexed_from_db(data)?
    } else {
        parse_decimal(data).ok_or_else(|| KraError::InvalidIndexedValue(data.to_string()))?
    };

    let revised = apply_offset(attribute, &value, id_offset)?;
    let revised = if indexed {
        indexed_to_db(&revised)?
    } else {
        revised.to_string()
    };

    debug!(attribute = %attribute, from = %data, to = %revised, "changed numeric data");
    Ok(format!("{}{}{}", attribute, delimiter, revised))
}
