//! Human-readable size strings such as `512MB` or `1.5GB`.

use thiserror::Error;

const MEGABYTE: u64 = 1024 * 1024;
const GIGABYTE: u64 = 1024 * MEGABYTE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeParseError {
    #[error("empty size string")]
    Empty,
    #[error("unsupported unit, use MB or GB")]
    UnsupportedUnit,
    #[error("invalid size value: {0}")]
    InvalidValue(String),
}

/// Parses a size with an `MB` or `GB` suffix (binary multiples, case-insensitive).
pub fn parse_size(input: &str) -> Result<u64, SizeParseError> {
    let normalized = input.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        return Err(SizeParseError::Empty);
    }

    let (number, multiplier) = if let Some(number) = normalized.strip_suffix("GB") {
        (number.trim(), GIGABYTE)
    } else if let Some(number) = normalized.strip_suffix("MB") {
        (number.trim(), MEGABYTE)
    } else {
        return Err(SizeParseError::UnsupportedUnit);
    };

    let value: f64 = number
        .parse()
        .map_err(|_| SizeParseError::InvalidValue(number.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(SizeParseError::InvalidValue(number.to_string()));
    }

    Ok((value * multiplier as f64) as u64)
}
