use serde::{Deserialize, Serialize};

/// A stored byte range `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub start: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Exclusive end offset (saturating).
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }

    /// Intersection with `[start, start + count)`, if non-empty.
    pub fn intersect(&self, start: u64, count: u64) -> Option<Extent> {
        let lo = self.start.max(start);
        let hi = self.end().min(start.saturating_add(count));
        if lo < hi {
            Some(Extent::new(lo, hi - lo))
        } else {
            None
        }
    }
}

/// Clips `extents` to `[start, start + count)` and rebases them so `start` maps to 0.
pub fn rebase_extents(extents: &[Extent], start: u64, count: u64) -> Vec<Extent> {
    extents
        .iter()
        .filter_map(|e| e.intersect(start, count))
        .map(|e| Extent::new(e.start - start, e.length))
        .collect()
}

/// Union of `extents` clipped to `[start, start + count)`.
///
/// The result is sorted by offset, and extents that overlap or touch are joined,
/// so a layer and its parent reporting the same block yield one extent.
pub fn union_in_range(
    extents: impl IntoIterator<Item = Extent>,
    start: u64,
    count: u64,
) -> Vec<Extent> {
    let mut clipped: Vec<Extent> = extents
        .into_iter()
        .filter_map(|e| e.intersect(start, count))
        .collect();
    clipped.sort_unstable_by_key(|e| e.start);

    let mut joined: Vec<Extent> = Vec::with_capacity(clipped.len());
    for e in clipped {
        match joined.last_mut() {
            Some(prev) if e.start <= prev.end() => {
                prev.length = prev.length.max(e.end() - prev.start);
            }
            _ => joined.push(e),
        }
    }
    joined
}
