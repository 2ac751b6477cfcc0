// src/pagination.rs
use std::ops::Range;

/// Slice bounds for a 1-based `page` of `page_size` entries over `len` entries.
/// Page 0 selects everything.
pub fn page_bounds(page: usize, page_size: usize, len: usize) -> Range<usize> {
    if page == 0 {
        return 0..len;
    }
    let start = ((page - 1).saturating_mul(page_size)).min(len);
    let end = start.saturating_add(page_size).min(len);
    start..end
}
