use thiserror::Error;

/// Inclusive byte window resolved against a known total length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Whole resource; `None` for an empty one.
    pub fn full(total: u64) -> Option<Self> {
        (total > 0).then(|| Self {
            start: 0,
            end: total - 1,
        })
    }

    /// Never zero; a parsed range always covers at least one byte.
    pub(crate) fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value, e.g. `bytes 4-9/13`.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RangeError {
    /// Not a single `bytes=` range we understand
    #[error("malformed range header")]
    Malformed,
    /// Well-formed but outside the resource, inverted, or empty
    #[error("range not satisfiable")]
    Unsatisfiable,
}

/// `Content-Range` value of a 416 response.
pub fn unsatisfied_content_range(total: u64) -> String {
    format!("bytes */{total}")
}

/// Parse a `Range` header against a resource of `total` bytes.
///
/// Accepts `bytes=start-end`, `bytes=start-` and `bytes=-suffix`. `end` is
/// clamped to `total - 1`; a suffix longer than the resource selects all of
/// it. `start >= total`, `end < start` and zero-length suffixes are
/// unsatisfiable.
pub fn parse_range_header(value: &str, total: u64) -> Result<ByteRange, RangeError> {
    let spec = value
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Malformed)?
        .trim();

    // Multi-range requests are not served
    if spec.contains(',') {
        return Err(RangeError::Malformed);
    }

    let (first, last) = spec.split_once('-').ok_or(RangeError::Malformed)?;
    let (first, last) = (first.trim(), last.trim());

    let parse = |s: &str| s.parse::<u64>().map_err(|_| RangeError::Malformed);

    let (start, end) = match (first.is_empty(), last.is_empty()) {
        (true, true) => return Err(RangeError::Malformed),
        (true, false) => {
            // Suffix range (e.g., "-500" means last 500 bytes)
            let suffix = parse(last)?;
            if suffix == 0 || total == 0 {
                return Err(RangeError::Unsatisfiable);
            }
            (total.saturating_sub(suffix), total - 1)
        }
        (false, true) => {
            let start = parse(first)?;
            (start, total.saturating_sub(1))
        }
        (false, false) => (parse(first)?, parse(last)?),
    };

    if start >= total || end < start {
        return Err(RangeError::Unsatisfiable);
    }

    Ok(ByteRange {
        start,
        end: end.min(total - 1),
    })
}
