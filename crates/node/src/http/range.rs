//! `Range: bytes=...` handling.

/// One byte range as written by the client, before the file size is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=a-b`, both inclusive.
    Bounded { start: u64, end: u64 },
    /// `bytes=a-`
    From { start: u64 },
    /// `bytes=-n`, the last `n` bytes.
    Suffix { length: u64 },
}

/// Parse a single-range header value.
///
/// Returns `None` for anything malformed and for multi-range requests; the
/// caller then serves the whole body, which is what a server that ignores
/// `Range` would do.
pub fn parse_range_header(value: &str) -> Option<RangeSpec> {
    let spec = value.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    match (start.is_empty(), end.is_empty()) {
        (true, true) => None,
        (true, false) => Some(RangeSpec::Suffix {
            length: end.parse().ok()?,
        }),
        (false, true) => Some(RangeSpec::From {
            start: start.parse().ok()?,
        }),
        (false, false) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            if end < start {
                return None;
            }
            Some(RangeSpec::Bounded { start, end })
        }
    }
}

impl RangeSpec {
    /// Inclusive `(first, last)` byte positions within a body of `total`
    /// bytes, or `None` when the range cannot be satisfied.
    pub fn resolve(self, total: u64) -> Option<(u64, u64)> {
        if total == 0 {
            return None;
        }
        let last_byte = total - 1;
        match self {
            RangeSpec::Bounded { start, end } if start <= last_byte => {
                Some((start, end.min(last_byte)))
            }
            RangeSpec::From { start } if start <= last_byte => Some((start, last_byte)),
            RangeSpec::Suffix { length } if length > 0 => {
                Some((total.saturating_sub(length), last_byte))
            }
            _ => None,
        }
    }
}

/// `Content-Range` value for a satisfied range.
pub fn content_range(first: u64, last: u64, total: u64) -> String {
    format!("bytes {}-{}/{}", first, last, total)
}

/// `Content-Range` value for a 416 response.
pub fn unsatisfied_range(total: u64) -> String {
    format!("bytes */{}", total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            parse_range_header("bytes=100-199"),
            Some(RangeSpec::Bounded { start: 100, end: 199 })
        );
        assert_eq!(parse_range_header("bytes=500-"), Some(RangeSpec::From { start: 500 }));
        assert_eq!(parse_range_header("bytes=-50"), Some(RangeSpec::Suffix { length: 50 }));
        assert_eq!(
            parse_range_header(" bytes= 1 - 2 "),
            Some(RangeSpec::Bounded { start: 1, end: 2 })
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for value in [
            "bytes=",
            "bytes=-",
            "bytes=9-3",
            "bytes=a-b",
            "items=0-1",
            "bytes=0-1,5-6",
        ] {
            assert_eq!(parse_range_header(value), None, "{}", value);
        }
    }

    #[test]
    fn test_resolve() {
        let total = 1000;
        assert_eq!(
            RangeSpec::Bounded { start: 100, end: 199 }.resolve(total),
            Some((100, 199))
        );
        // End past EOF is clamped.
        assert_eq!(
            RangeSpec::Bounded { start: 900, end: 5000 }.resolve(total),
            Some((900, 999))
        );
        assert_eq!(RangeSpec::From { start: 999 }.resolve(total), Some((999, 999)));
        assert_eq!(RangeSpec::Suffix { length: 10 }.resolve(total), Some((990, 999)));
        assert_eq!(RangeSpec::Suffix { length: 5000 }.resolve(total), Some((0, 999)));
    }

    #[test]
    fn test_resolve_unsatisfiable() {
        assert_eq!(RangeSpec::From { start: 1000 }.resolve(1000), None);
        assert_eq!(RangeSpec::Bounded { start: 1000, end: 1001 }.resolve(1000), None);
        assert_eq!(RangeSpec::Suffix { length: 0 }.resolve(1000), None);
        assert_eq!(RangeSpec::From { start: 0 }.resolve(0), None);
    }

    #[test]
    fn test_header_values() {
        assert_eq!(content_range(100, 199, 1000), "bytes 100-199/1000");
        assert_eq!(unsatisfied_range(1000), "bytes */1000");
    }
}
