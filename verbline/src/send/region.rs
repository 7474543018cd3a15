//! Lookup of pre-registered memory for zero-copy sends.

use crate::config::MemoryRange;
use crate::error::{Error, Result};

/// Reject zero-sized and overlapping ranges.
pub(crate) fn validate_ranges(ranges: &[MemoryRange]) -> Result<()> {
    if ranges.iter().any(|r| r.is_empty()) {
        return Err(Error::invalid("memory region must have non-zero size"));
    }
    let mut sorted: Vec<(usize, usize)> = ranges
        .iter()
        .map(|r| (r.ptr() as usize, r.len()))
        .collect();
    sorted.sort_unstable();
    for pair in sorted.windows(2) {
        let (start, len) = pair[0];
        if start + len > pair[1].0 {
            return Err(Error::invalid("memory regions overlap"));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    start: usize,
    len: usize,
    lkey: u32,
}

/// Registered ranges, sorted by descending start address.
#[derive(Debug, Default)]
pub(crate) struct RegionSet {
    entries: Vec<Entry>,
}

impl RegionSet {
    /// Build from `(start, len, lkey)` triples. The ranges must already have
    /// passed [`validate_ranges`].
    pub(crate) fn new(regions: impl IntoIterator<Item = (usize, usize, u32)>) -> Self {
        let mut entries: Vec<Entry> = regions
            .into_iter()
            .map(|(start, len, lkey)| Entry { start, len, lkey })
            .collect();
        entries.sort_unstable_by(|a, b| b.start.cmp(&a.start));
        RegionSet { entries }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Local key of the region containing `[ptr, ptr + len)`, if any.
    ///
    /// Finds the first region starting at or below `ptr`; only that region
    /// can contain it, because regions do not overlap.
    #[inline]
    pub(crate) fn lookup(&self, ptr: usize, len: usize) -> Option<u32> {
        let idx = self.entries.partition_point(|e| e.start > ptr);
        let e = self.entries.get(idx)?;
        (ptr + len <= e.start + e.len).then_some(e.lkey)
    }
}
