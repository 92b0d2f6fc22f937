//! Materialized region views handed to the UI.

use super::status::RegionStatus;

/// Derived grouping for list presentation. Not owned state; recomputed
/// every time a region is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// The region covers (or is nearest to) the last known location.
    NearMe,
    /// On disk, current or updatable.
    Downloaded,
    /// Everything else.
    Other,
}

/// One row of a `list_items` answer.
///
/// Built on demand from the tree, the on-disk file set and the active
/// job table; never stored. For a non-leaf, `status` and the byte
/// counters are pure functions of the leaf descendants.
#[derive(Debug, Clone)]
pub struct RegionItem {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub parent_name: Option<String>,
    pub size_bytes: u64,
    pub downloaded_bytes: u64,
    /// Direct children (0 for a leaf).
    pub child_count: usize,
    /// Leaf descendants (1 for a leaf).
    pub total_child_count: usize,
    pub category: Category,
    pub status: RegionStatus,
}

impl RegionItem {
    /// Whether this row represents a single map file.
    pub fn is_leaf(&self) -> bool {
        self.child_count == 0
    }

    /// Download completion in percent, clamped to 0..=100.
    pub fn progress_percent(&self) -> u8 {
        if self.size_bytes == 0 {
            return 0;
        }
        ((self.downloaded_bytes.min(self.size_bytes)) * 100 / self.size_bytes) as u8
    }
}

/// Summary of everything updatable, for the "update all" banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateInfo {
    pub file_count: usize,
    pub total_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(size: u64, downloaded: u64) -> RegionItem {
        RegionItem {
            id: "France".into(),
            parent_id: None,
            name: "France".into(),
            parent_name: None,
            size_bytes: size,
            downloaded_bytes: downloaded,
            child_count: 0,
            total_child_count: 1,
            category: Category::Other,
            status: RegionStatus::InProgress,
        }
    }

    #[test]
    fn test_progress_percent_clamps() {
        assert_eq!(item(1000, 400).progress_percent(), 40);
        assert_eq!(item(1000, 2000).progress_percent(), 100);
        assert_eq!(item(0, 0).progress_percent(), 0);
    }
}
