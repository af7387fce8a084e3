//! Read-only snapshot of the range list, folded from existing state for the
//! loader's diagnostic screen (SPEC_FULL.md §7 — not in the distilled spec,
//! but present in every comparable PMM and free to derive from `insert`).

use super::range::{MemoryRange, MemoryType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PmmStats {
    pub free_bytes: u64,
    pub reserved_bytes: u64,
    pub reclaimable_bytes: u64,
    pub internal_bytes: u64,
    pub range_count: usize,
}

impl PmmStats {
    pub(super) fn collect(ranges: &[MemoryRange]) -> Self {
        let mut stats = PmmStats {
            range_count: ranges.len(),
            ..Default::default()
        };
        for r in ranges {
            match r.kind {
                MemoryType::Free => stats.free_bytes += r.size,
                MemoryType::Reclaimable => stats.reclaimable_bytes += r.size,
                MemoryType::Internal => stats.internal_bytes += r.size,
                MemoryType::Allocated
                | MemoryType::PageTables
                | MemoryType::Stack
                | MemoryType::Modules => stats.reserved_bytes += r.size,
            }
        }
        stats
    }
}
