//! Physical Memory Map: a single ordered list of typed, non-overlapping,
//! page-aligned ranges covering everything the platform probe announced
//! (spec.md §4.2).
//!
//! `insert` is the one primitive every mutating operation reduces to —
//! `add`, `alloc`, `free`, `protect`, and the `Internal`-reclaiming step of
//! `finalize` are all thin callers of it. The list itself is an
//! `alloc::vec::Vec<MemoryRange>` sorted by `start`; its backing storage
//! comes from [`crate::heap`], so "range records live on the heap" (spec.md
//! §3) falls out of using the ordinary global allocator rather than a
//! bespoke arena.

pub mod platform;
pub mod range;
pub mod stats;

use alloc::vec::Vec;

pub use platform::{AddrTranslator, IdentityTranslator, PlatformProbe};
pub use range::{MemoryRange, MemoryType};
pub use stats::PmmStats;

use crate::config::{is_aligned, PAGE_SIZE};
use crate::sync::Mutex;

#[cfg(not(feature = "target_has_mm"))]
use crate::config::{align_down, align_up, TARGET_PHYS_MAX, TARGET_PHYS_MIN};

bitflags::bitflags! {
    /// Flags accepted by [`Pmm::alloc`] (spec.md §4.2.2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Place the allocation at the highest legal address instead of the lowest.
        const HIGH = 1 << 0;
        /// Return `None` instead of invoking `boot_error!` when no range fits.
        const CAN_FAIL = 1 << 1;
    }
}

#[cfg(not(feature = "target_has_mm"))]
static TRANSLATOR: Mutex<Option<&'static dyn AddrTranslator>> = Mutex::new(None);
#[cfg(not(feature = "target_has_mm"))]
static IDENTITY: IdentityTranslator = IdentityTranslator;

/// Install the platform's address translator. Must outlive every subsequent
/// `alloc`/`free` call.
#[cfg(not(feature = "target_has_mm"))]
pub fn set_translator(t: &'static dyn AddrTranslator) {
    *TRANSLATOR.lock() = Some(t);
}

#[cfg(not(feature = "target_has_mm"))]
fn translator() -> &'static dyn AddrTranslator {
    TRANSLATOR.lock().unwrap_or(&IDENTITY)
}

/// The physical memory map itself. One instance is the process-wide
/// singleton (see [`PMM`]); tests construct independent instances.
pub struct Pmm {
    inner: Mutex<Vec<MemoryRange>>,
}

impl Pmm {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// The central primitive (spec.md §4.2.1): `[start, start+size)` with
    /// `kind` overwrites any overlapping portion of existing ranges, then
    /// merges with same-type neighbors.
    pub fn insert(&self, start: u64, size: u64, kind: MemoryType) {
        if size == 0 {
            crate::internal_error!("zero-length memory range at {:#x}", start);
        }
        if !is_aligned(start, PAGE_SIZE as u64) || !is_aligned(size, PAGE_SIZE as u64) {
            crate::internal_error!(
                "unaligned memory range {:#x}+{:#x}",
                start,
                size
            );
        }
        self.inner.lock_with(|ranges| insert_locked(ranges, start, size, kind));
    }

    /// Thin wrapper used by platform probes to seed the map (spec.md §4.2.4).
    pub fn add(&self, start: u64, size: u64, kind: MemoryType) {
        self.insert(start, size, kind);
    }

    /// Constraint-aware allocation from `Free` ranges (spec.md §4.2.2).
    #[cfg(not(feature = "target_has_mm"))]
    pub fn alloc(
        &self,
        size: u64,
        align: u64,
        min_addr: u64,
        max_addr: u64,
        kind: MemoryType,
        flags: AllocFlags,
    ) -> Option<(usize, u64)> {
        if kind == MemoryType::Free {
            crate::internal_error!("alloc type must not be Free");
        }
        let align = if align == 0 { PAGE_SIZE as u64 } else { align };
        if !is_aligned(size, PAGE_SIZE as u64)
            || !align.is_power_of_two()
            || !is_aligned(align, PAGE_SIZE as u64)
        {
            crate::internal_error!("invalid size/align for pmm alloc");
        }

        let min = if min_addr == 0 { TARGET_PHYS_MIN } else { min_addr };
        let max = if max_addr == 0 || max_addr > TARGET_PHYS_MAX {
            TARGET_PHYS_MAX
        } else {
            max_addr
        };

        let placement = {
            let ranges = self.inner.lock();
            find_placement(&ranges, size, align, min, max, flags.contains(AllocFlags::HIGH))
        };

        match placement {
            Some(phys) => {
                self.insert(phys, size, kind);
                Some((translator().phys_to_virt(phys), phys))
            }
            None if flags.contains(AllocFlags::CAN_FAIL) => None,
            None => crate::boot_error!(
                "no range satisfies alloc(size={:#x}, align={:#x}, min={:#x}, max={:#x})",
                size,
                align,
                min,
                max
            ),
        }
    }

    /// Inverse of `alloc` for consumers that over-reserved (spec.md §4.2.3).
    #[cfg(not(feature = "target_has_mm"))]
    pub fn free(&self, virt_ptr: usize, size: u64) {
        let phys = translator().virt_to_phys(virt_ptr);
        if !is_aligned(phys, PAGE_SIZE as u64) || !is_aligned(size, PAGE_SIZE as u64) {
            crate::internal_error!("unaligned memory_free at {:#x}", phys);
        }

        let contained = {
            let ranges = self.inner.lock();
            ranges
                .iter()
                .any(|r| r.kind != MemoryType::Free && r.start <= phys && phys + size <= r.end())
        };
        if !contained {
            crate::internal_error!("bad free: {:#x}+{:#x} not inside a reserved range", phys, size);
        }
        self.insert(phys, size, MemoryType::Free);
    }

    /// Reclassify the free portions of `[start, start+size)` as `Internal`
    /// (spec.md §4.2.5), after page-aligning the window outward.
    #[cfg(not(feature = "target_has_mm"))]
    pub fn protect(&self, start: u64, size: u64) {
        let lo = align_down(start, PAGE_SIZE as u64);
        let hi = align_up(start + size, PAGE_SIZE as u64);

        let pieces: Vec<(u64, u64)> = {
            let ranges = self.inner.lock();
            ranges
                .iter()
                .filter(|r| r.kind == MemoryType::Free)
                .filter_map(|r| {
                    let os = r.start.max(lo);
                    let oe = r.end().min(hi);
                    (os < oe).then_some((os, oe - os))
                })
                .collect()
        };
        for (start, size) in pieces {
            self.insert(start, size, MemoryType::Internal);
        }
    }

    /// Probe the platform, protect the loader's own image, and dump the
    /// resulting map (spec.md §4.2.6).
    #[cfg(not(feature = "target_has_mm"))]
    pub fn init(&self, probe: &dyn PlatformProbe, image_start: u64, image_end: u64) {
        probe.probe(self);
        self.protect(image_start, image_end - image_start);
        self.dump();
    }

    /// Fold every `Internal` range back to `Free` and hand the whole list
    /// over, leaving this map empty (spec.md §4.2.7).
    #[cfg(not(feature = "target_has_mm"))]
    pub fn finalize(&self) -> Vec<MemoryRange> {
        loop {
            let internal = {
                let ranges = self.inner.lock();
                ranges.iter().find(|r| r.kind == MemoryType::Internal).copied()
            };
            match internal {
                Some(r) => self.insert(r.start, r.size, MemoryType::Free),
                None => break,
            }
        }
        let mut ranges = self.inner.lock();
        core::mem::take(&mut *ranges)
    }

    /// Diagnostic emission of every range (spec.md §4.2.8).
    pub fn dump(&self) {
        let ranges = self.inner.lock();
        crate::kinfo!("pmm: {} range(s)", ranges.len());
        #[allow(unused_variables)]
        for r in ranges.iter() {
            crate::kdebug!(
                "  [{:#010x}, {:#010x}) {}K {}",
                r.start,
                r.end(),
                r.size / 1024,
                r.kind.label()
            );
        }
    }

    /// Snapshot of free/reserved/reclaimable/internal totals (SPEC_FULL.md §7).
    pub fn stats(&self) -> PmmStats {
        PmmStats::collect(&self.inner.lock())
    }

    /// Copy of the current range list, for tests and dump formatting.
    #[cfg(test)]
    pub fn ranges(&self) -> Vec<MemoryRange> {
        self.inner.lock().clone()
    }
}

/// Boot-time self-test cases for the PMM, run from a platform's init path
/// (see [`crate::self_test`]) right after the first probe seeds the map.
#[cfg(feature = "self_test")]
pub mod self_test {
    use super::{MemoryType, Pmm};
    use crate::self_test::TestCase;

    crate::ktest!(insert_merges_adjacent_same_type, {
        let pmm = Pmm::new();
        pmm.add(0, 0x1000, MemoryType::Free);
        pmm.add(0x1000, 0x1000, MemoryType::Free);
        let stats = pmm.stats();
        crate::kassert_eq!(stats.range_count, 1);
        crate::kassert_eq!(stats.free_bytes, 0x2000);
    });

    #[cfg(not(feature = "target_has_mm"))]
    crate::ktest!(alloc_then_free_restores_stats, {
        let pmm = Pmm::new();
        pmm.add(0, 0x2000, MemoryType::Free);
        let before = pmm.stats();
        let (virt, _) = pmm
            .alloc(0x1000, 0x1000, 0, 0, MemoryType::Allocated, super::AllocFlags::empty())
            .unwrap();
        pmm.free(virt, 0x1000);
        let after = pmm.stats();
        crate::kassert_eq!(before, after);
    });

    #[cfg(not(feature = "target_has_mm"))]
    pub const CASES: &[TestCase] = &[
        TestCase::new("pmm::insert_merges_adjacent_same_type", insert_merges_adjacent_same_type),
        TestCase::new("pmm::alloc_then_free_restores_stats", alloc_then_free_restores_stats),
    ];

    #[cfg(feature = "target_has_mm")]
    pub const CASES: &[TestCase] = &[TestCase::new(
        "pmm::insert_merges_adjacent_same_type",
        insert_merges_adjacent_same_type,
    )];
}

trait MutexExt<T> {
    fn lock_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }
}

fn insert_locked(ranges: &mut Vec<MemoryRange>, start: u64, size: u64, kind: MemoryType) {
    let new_end = start + size;

    let mut i = 0;
    while i < ranges.len() {
        let r = ranges[i];
        if !r.overlaps(start, new_end) {
            if r.end() <= start {
                i += 1;
                continue;
            }
            break;
        }

        if r.start < start && r.end() > new_end {
            // `r` fully contains the new range: split it around the hole.
            ranges[i] = MemoryRange::new(r.start, start - r.start, r.kind);
            ranges.insert(i + 1, MemoryRange::new(new_end, r.end() - new_end, r.kind));
            break;
        } else if r.start < start {
            // Left trim: predecessor's tail is absorbed.
            ranges[i] = MemoryRange::new(r.start, start - r.start, r.kind);
            i += 1;
        } else if r.end() > new_end {
            // Right trim: successor's head is absorbed; nothing further overlaps.
            ranges[i] = MemoryRange::new(new_end, r.end() - new_end, r.kind);
            break;
        } else {
            // Fully covered by the new range: gone.
            ranges.remove(i);
        }
    }

    let pos = ranges.partition_point(|r| r.start < start);
    ranges.insert(pos, MemoryRange::new(start, size, kind));
    let mut pos = pos;

    if pos > 0 && ranges[pos - 1].kind == kind && ranges[pos - 1].abuts(&ranges[pos]) {
        ranges[pos - 1].size += ranges[pos].size;
        ranges.remove(pos);
        pos -= 1;
    }
    if pos + 1 < ranges.len() && ranges[pos].kind == ranges[pos + 1].kind && ranges[pos].abuts(&ranges[pos + 1]) {
        ranges[pos].size += ranges[pos + 1].size;
        ranges.remove(pos + 1);
    }
}

#[cfg(not(feature = "target_has_mm"))]
fn find_placement(
    ranges: &[MemoryRange],
    size: u64,
    align: u64,
    min: u64,
    max: u64,
    high: bool,
) -> Option<u64> {
    let candidate = |r: &MemoryRange| -> Option<u64> {
        if r.kind != MemoryType::Free {
            return None;
        }
        let lo = r.start.max(min);
        let hi = r.end().min(max.checked_add(1)?);
        if lo >= hi {
            return None;
        }
        if high {
            let placement = align_down(hi.checked_sub(size)?, align);
            (placement >= lo).then_some(placement)
        } else {
            let placement = align_up(lo, align);
            (placement.checked_add(size)? <= hi).then_some(placement)
        }
    };

    if high {
        ranges.iter().rev().find_map(candidate)
    } else {
        ranges.iter().find_map(candidate)
    }
}

/// Process-wide physical memory map singleton.
pub static PMM: Pmm = Pmm::new();

#[cfg(test)]
mod tests {
    use super::*;

    fn range_tuples(pmm: &Pmm) -> Vec<(u64, u64, MemoryType)> {
        pmm.ranges().into_iter().map(|r| (r.start, r.size, r.kind)).collect()
    }

    #[test]
    fn scenario_1_seed_two_adjacent_free_merges() {
        let pmm = Pmm::new();
        pmm.add(0, 0x100000, MemoryType::Free);
        pmm.add(0x100000, 0x100000, MemoryType::Free);
        assert_eq!(range_tuples(&pmm), vec![(0, 0x200000, MemoryType::Free)]);
    }

    #[test]
    #[cfg(not(feature = "target_has_mm"))]
    fn scenario_2_low_alloc_from_front() {
        let pmm = Pmm::new();
        pmm.add(0, 0x200000, MemoryType::Free);
        let (_, phys) = pmm
            .alloc(0x1000, 0x1000, 0, 0, MemoryType::Allocated, AllocFlags::empty())
            .unwrap();
        assert_eq!(phys, 0x0);
        assert_eq!(
            range_tuples(&pmm),
            vec![
                (0, 0x1000, MemoryType::Allocated),
                (0x1000, 0x1FF000, MemoryType::Free),
            ]
        );
    }

    #[test]
    #[cfg(not(feature = "target_has_mm"))]
    fn scenario_3_high_alloc_from_back() {
        let pmm = Pmm::new();
        pmm.add(0, 0x200000, MemoryType::Free);
        let (_, phys) = pmm
            .alloc(0x2000, 0x1000, 0, 0, MemoryType::Stack, AllocFlags::HIGH)
            .unwrap();
        assert_eq!(phys, 0x1FE000);
        assert_eq!(
            range_tuples(&pmm),
            vec![
                (0, 0x1FE000, MemoryType::Free),
                (0x1FE000, 0x2000, MemoryType::Stack),
            ]
        );
    }

    #[test]
    #[cfg(not(feature = "target_has_mm"))]
    fn scenario_4_finalize_reclaims_internal() {
        let pmm = Pmm::new();
        pmm.add(0, 0x200000, MemoryType::Free);
        pmm.insert(0x0, 0x10000, MemoryType::Internal);
        let out = pmm.finalize();
        assert_eq!(out, vec![MemoryRange::new(0, 0x200000, MemoryType::Free)]);
        assert!(pmm.ranges().is_empty());
    }

    #[test]
    fn scenario_5_insert_splits_surrounding_free() {
        let pmm = Pmm::new();
        pmm.add(0, 0x10000, MemoryType::Free);
        pmm.insert(0x1000, 0x2000, MemoryType::Allocated);
        assert_eq!(
            range_tuples(&pmm),
            vec![
                (0, 0x1000, MemoryType::Free),
                (0x1000, 0x2000, MemoryType::Allocated),
                (0x3000, 0xD000, MemoryType::Free),
            ]
        );
    }

    #[test]
    #[cfg(not(feature = "target_has_mm"))]
    fn alloc_then_free_restores_map() {
        // P4: alloc followed by free of the same extent restores the map.
        let pmm = Pmm::new();
        pmm.add(0, 0x200000, MemoryType::Free);
        let before = range_tuples(&pmm);
        let (virt, _) = pmm
            .alloc(0x1000, 0x1000, 0, 0, MemoryType::Allocated, AllocFlags::empty())
            .unwrap();
        pmm.free(virt, 0x1000);
        assert_eq!(range_tuples(&pmm), before);
    }

    #[test]
    #[cfg(not(feature = "target_has_mm"))]
    fn alloc_can_fail_returns_none_when_exhausted() {
        let pmm = Pmm::new();
        pmm.add(0, 0x1000, MemoryType::Free);
        let result = pmm.alloc(
            0x2000,
            0x1000,
            0,
            0,
            MemoryType::Allocated,
            AllocFlags::CAN_FAIL,
        );
        assert!(result.is_none());
    }

    #[test]
    #[cfg(not(feature = "target_has_mm"))]
    #[should_panic(expected = "boot error")]
    fn alloc_without_can_fail_is_fatal_when_exhausted() {
        let pmm = Pmm::new();
        pmm.add(0, 0x1000, MemoryType::Free);
        pmm.alloc(0x2000, 0x1000, 0, 0, MemoryType::Allocated, AllocFlags::empty());
    }

    #[test]
    #[cfg(not(feature = "target_has_mm"))]
    #[should_panic(expected = "invalid size/align")]
    fn alloc_rejects_power_of_two_align_not_page_aligned() {
        // `align = 8` is a power of two but not a multiple of PAGE_SIZE; the
        // check must reject it here rather than let a sub-page placement
        // surface later as an unrelated "unaligned memory range" fatal.
        let pmm = Pmm::new();
        pmm.add(0, 0x200000, MemoryType::Free);
        pmm.alloc(0x1000, 8, 0, 0, MemoryType::Allocated, AllocFlags::empty());
    }

    #[test]
    #[cfg(not(feature = "target_has_mm"))]
    #[should_panic(expected = "bad free")]
    fn free_outside_any_reserved_range_is_fatal() {
        let pmm = Pmm::new();
        pmm.add(0, 0x200000, MemoryType::Free);
        pmm.free(0x1000, 0x1000);
    }

    #[test]
    #[cfg(not(feature = "target_has_mm"))]
    fn protect_marks_only_free_portion_internal() {
        let pmm = Pmm::new();
        pmm.add(0, 0x3000, MemoryType::Free);
        pmm.insert(0x1000, 0x1000, MemoryType::Allocated);
        pmm.protect(0, 0x3000);
        assert_eq!(
            range_tuples(&pmm),
            vec![
                (0, 0x1000, MemoryType::Internal),
                (0x1000, 0x1000, MemoryType::Allocated),
                (0x2000, 0x1000, MemoryType::Internal),
            ]
        );
    }

    #[test]
    fn no_two_adjacent_ranges_share_a_type_after_inserts() {
        // P1, restated as a small exhaustive sequence.
        let pmm = Pmm::new();
        pmm.add(0, 0x4000, MemoryType::Free);
        pmm.insert(0x1000, 0x1000, MemoryType::Allocated);
        pmm.insert(0x2000, 0x1000, MemoryType::Allocated);
        // The two Allocated ranges must have merged into one.
        assert_eq!(
            range_tuples(&pmm),
            vec![
                (0, 0x1000, MemoryType::Free),
                (0x1000, 0x2000, MemoryType::Allocated),
                (0x3000, 0x1000, MemoryType::Free),
            ]
        );
    }

    #[test]
    #[should_panic(expected = "zero-length")]
    fn zero_length_insert_is_fatal() {
        let pmm = Pmm::new();
        pmm.insert(0x1000, 0, MemoryType::Free);
    }

    #[test]
    fn equal_start_insert_replaces_existing_type() {
        // spec.md §4.2.1 edge case: a range coinciding exactly with an
        // existing one of a different type replaces it entirely.
        let pmm = Pmm::new();
        pmm.add(0x1000, 0x1000, MemoryType::Free);
        pmm.insert(0x1000, 0x1000, MemoryType::Allocated);
        assert_eq!(range_tuples(&pmm), vec![(0x1000, 0x1000, MemoryType::Allocated)]);
    }
}
