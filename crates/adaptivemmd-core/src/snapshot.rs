//! Point-in-time views of a node's allocator state.

/// Number of buddy-allocator orders tracked per zone (order 0..=10).
pub const MAX_ORDER: usize = 11;

/// Free-page count for one fragmentation order at one sample instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragEntry {
    pub free_pages: u64,
    /// Sample timestamp, milliseconds since an arbitrary epoch fixed at
    /// daemon startup. Only differences between entries are meaningful.
    pub msecs: i64,
}

/// A single node's watermark geometry and per-order fragmentation, as read
/// from `/proc/buddyinfo` and `/proc/zoneinfo` in one sampling pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub managed_pages: u64,
    pub min_wmark: u64,
    pub low_wmark: u64,
    pub high_wmark: u64,
    /// Free-page history for orders `0..MAX_ORDER`, most recent last.
    pub frag: Vec<FragEntry>,
}

impl NodeSnapshot {
    pub fn new(managed_pages: u64, min_wmark: u64, low_wmark: u64, high_wmark: u64) -> Self {
        Self {
            managed_pages,
            min_wmark,
            low_wmark,
            high_wmark,
            frag: Vec::new(),
        }
    }
}
