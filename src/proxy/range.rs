use thiserror::Error;

/// Inclusive byte span within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("range unit is not bytes")]
    UnsupportedUnit,
    #[error("multiple ranges are not supported")]
    MultipleRanges,
    #[error("malformed byte range")]
    Malformed,
    #[error("range starts beyond the end of the object")]
    NotSatisfiable,
}

/// Resolves a single `Range` header value against an object of `size` bytes.
pub fn parse_range(header: &str, size: u64) -> Result<ByteRange, RangeError> {
    let (unit, spec) = header
        .trim()
        .split_once('=')
        .ok_or(RangeError::Malformed)?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Err(RangeError::UnsupportedUnit);
    }
    if spec.contains(',') {
        return Err(RangeError::MultipleRanges);
    }
    let (first, last) = spec.trim().split_once('-').ok_or(RangeError::Malformed)?;
    let (first, last) = (first.trim(), last.trim());

    let (start, end) = match (first.is_empty(), last.is_empty()) {
        (true, true) => return Err(RangeError::Malformed),
        (true, false) => {
            let suffix = parse_offset(last)?;
            (size - suffix.min(size), size.saturating_sub(1))
        }
        (false, true) => (parse_offset(first)?, size.saturating_sub(1)),
        (false, false) => {
            let start = parse_offset(first)?;
            let end = parse_offset(last)?;
            if start > end {
                return Err(RangeError::Malformed);
            }
            (start, end.min(size.saturating_sub(1)))
        }
    };

    if start >= size {
        return Err(RangeError::NotSatisfiable);
    }
    Ok(ByteRange { start, end })
}

fn parse_offset(value: &str) -> Result<u64, RangeError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Malformed);
    }
    value.parse().map_err(|_| RangeError::Malformed)
}
