//! Free-space search shared by the partition schemes.
//!
//! All functions work on inclusive `(first, last)` spans in an arbitrary unit (sectors
//! or cylinders).

use crate::util::{align_down_u64, align_up_u64};
use crate::{DiskError, Result};

/// Lowest start of a run of `count` free units in `[first_usable, last_usable]`,
/// aligned to `alignment` units.
pub(crate) fn find_gap(
    used: &[(u64, u64)],
    first_usable: u64,
    last_usable: u64,
    count: u64,
    alignment: u64,
) -> Result<u64> {
    let insufficient = DiskError::InsufficientSpace {
        requested_sectors: count,
    };
    if count == 0 {
        return Err(DiskError::InvalidConfig("allocation size must be > 0"));
    }

    let mut sorted = used.to_vec();
    sorted.sort_unstable_by_key(|(first, _)| *first);

    let mut start = align_up_u64(first_usable, alignment)?;
    for (first, last) in sorted {
        if last < start {
            continue;
        }
        if start.checked_add(count).is_some_and(|end| end <= first) {
            return Ok(start);
        }
        start = align_up_u64(last + 1, alignment)?;
    }

    match start.checked_add(count - 1) {
        Some(end) if end <= last_usable => Ok(start),
        _ => Err(insufficient),
    }
}

/// Aligned allocation: returns `(first, last)` for `count` units starting in the first
/// fitting gap, with `last + 1` rounded down to the alignment.
pub(crate) fn allocate_aligned(
    used: &[(u64, u64)],
    first_usable: u64,
    last_usable: u64,
    count: u64,
    alignment: u64,
) -> Result<(u64, u64)> {
    if count < alignment {
        return Err(DiskError::InvalidConfig(
            "partition size must be at least the alignment",
        ));
    }
    let first = find_gap(used, first_usable, last_usable, count, alignment)?;
    let end = align_down_u64(first + count, alignment)?;
    Ok((first, end - 1))
}

/// Sectors per alignment unit; the alignment must be a non-zero multiple of the sector size.
pub(crate) fn alignment_in_sectors(alignment_bytes: u64, sector_size: u64) -> Result<u64> {
    if alignment_bytes == 0 || alignment_bytes % sector_size != 0 {
        return Err(DiskError::InvalidConfig(
            "alignment must be a non-zero multiple of the sector size",
        ));
    }
    Ok(alignment_bytes / sector_size)
}

/// Whole-disk placement: after the last used span, up to the next used span or the end.
pub(crate) fn trailing_free_span(
    used: &[(u64, u64)],
    first_usable: u64,
    last_usable: u64,
) -> Result<(u64, u64)> {
    let start = used
        .iter()
        .map(|(_, last)| last + 1)
        .max()
        .unwrap_or(first_usable)
        .max(first_usable);
    let end = used
        .iter()
        .map(|(first, _)| *first)
        .filter(|first| *first > start)
        .min()
        .map_or(last_usable, |next| next - 1)
        .min(last_usable);
    if start > end {
        return Err(DiskError::InsufficientSpace {
            requested_sectors: 1,
        });
    }
    Ok((start, end))
}

pub(crate) fn overlaps_any(used: &[(u64, u64)], first: u64, last: u64) -> bool {
    used.iter().any(|(f, l)| *f <= last && first <= *l)
}
