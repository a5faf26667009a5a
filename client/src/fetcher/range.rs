//! `Content-Range` response header parsing.

/// A parsed `Content-Range` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRange {
    /// `bytes start-end/total`, where `total` may be `*`.
    Bytes {
        start: u64,
        end: u64,
        total: Option<u64>,
    },
    /// `bytes */total`, sent along with `416 Range Not Satisfiable`.
    Unsatisfied { total: u64 },
}

/// Parses a `Content-Range` header value; `None` when it is malformed or
/// uses a unit other than bytes.
///
/// # Examples
///
/// ```
/// use omnifetch::fetcher::range::{ContentRange, parse_content_range};
///
/// assert_eq!(
///     parse_content_range("bytes 4096-9999/10000"),
///     Some(ContentRange::Bytes { start: 4096, end: 9999, total: Some(10000) })
/// );
/// assert_eq!(
///     parse_content_range("bytes */10000"),
///     Some(ContentRange::Unsatisfied { total: 10000 })
/// );
/// ```
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?;
    if !rest.starts_with([' ', '=']) {
        return None;
    }
    let (range, total) = rest[1..].trim().split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().ok()?),
    };

    if range.trim() == "*" {
        return total.map(|total| ContentRange::Unsatisfied { total });
    }

    let (start, end) = range.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start || total.is_some_and(|t| end >= t) {
        return None;
    }
    Some(ContentRange::Bytes { start, end, total })
}
