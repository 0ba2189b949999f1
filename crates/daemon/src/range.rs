use nimbus_core::Range;

/// Parses a `Range` request header against a resource of `total` bytes.
/// Supports `bytes=a-b`, `bytes=a-`, and the suffix form `bytes=-n`.
/// Returns `None` when the header is malformed or unsatisfiable.
pub fn parse_range(header: &str, total: u64) -> Option<Range> {
    let spec = header.strip_prefix("bytes=")?.trim();
    // Multi-range requests are not supported; take only a single spec.
    if spec.contains(',') {
        return None;
    }
    let (start_text, end_text) = spec.split_once('-')?;
    if start_text.is_empty() {
        // Suffix form: last n bytes.
        let suffix: u64 = end_text.parse().ok()?;
        if suffix == 0 || total == 0 {
            return None;
        }
        let len = suffix.min(total);
        return Some(Range::new(total - len, len));
    }
    let start: u64 = start_text.parse().ok()?;
    if start >= total && total > 0 {
        return None;
    }
    if total == 0 && start > 0 {
        return None;
    }
    if end_text.is_empty() {
        return Some(Range {
            start,
            size: None,
        });
    }
    let end: u64 = end_text.parse().ok()?;
    if end < start {
        return None;
    }
    Some(Range::new(start, end - start + 1))
}
