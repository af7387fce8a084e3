//! Intra-loader heap: `alloc`/`realloc`/`free` over a fixed, page-aligned
//! backing region.
//!
//! Chunks are an intrusive, address-ordered doubly linked list living
//! directly inside the backing region — the header sits immediately before
//! each chunk's payload, so freeing only needs the payload pointer, by
//! casting it back to a header by a fixed offset. The region is carved into
//! one big free chunk lazily, on the first allocation, rather than at
//! construction time, so `Heap::new()` stays a `const fn` usable in a
//! `static`.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr;

use crate::config::{HEAP_SIZE, PAGE_SIZE};
use crate::sync::Mutex;

/// A byte array pinned to a page boundary. `repr(align(N))` needs a literal,
/// so the alignment here is asserted equal to [`PAGE_SIZE`] below rather than
/// expressed in terms of it directly.
#[repr(C, align(4096))]
struct PageAligned<const N: usize>([u8; N]);

const _: () = assert!(4096 == PAGE_SIZE, "PageAligned's alignment must track PAGE_SIZE");

/// Chunk header. Lives at the start of every chunk, allocated or free;
/// `size` counts the header itself.
#[repr(C, align(8))]
struct ChunkHeader {
    size: usize,
    allocated: bool,
    prev: *mut ChunkHeader,
    next: *mut ChunkHeader,
}

const HEADER_SIZE: usize = size_of::<ChunkHeader>();

#[inline(always)]
fn round_up8(n: usize) -> usize {
    (n + 7) & !7
}

struct HeapInner<const N: usize> {
    backing: UnsafeCell<PageAligned<N>>,
    head: *mut ChunkHeader,
}

// SAFETY: all access to `backing` and `head` happens through `Heap`'s mutex.
unsafe impl<const N: usize> Send for HeapInner<N> {}

impl<const N: usize> HeapInner<N> {
    const fn new() -> Self {
        Self {
            backing: UnsafeCell::new(PageAligned([0u8; N])),
            head: ptr::null_mut(),
        }
    }

    fn base(&self) -> *mut u8 {
        self.backing.get() as *mut u8
    }

    /// Carve the whole backing region into one free chunk, on first use.
    fn ensure_init(&mut self) {
        if !self.head.is_null() {
            return;
        }
        let head = self.base() as *mut ChunkHeader;
        unsafe {
            (*head).size = N;
            (*head).allocated = false;
            (*head).prev = ptr::null_mut();
            (*head).next = ptr::null_mut();
        }
        self.head = head;
    }

    /// # Safety
    /// `chunk` must be a live chunk header belonging to this heap's region.
    unsafe fn payload_of(chunk: *mut ChunkHeader) -> *mut u8 {
        (chunk as *mut u8).add(HEADER_SIZE)
    }

    /// # Safety
    /// `payload` must have been returned by a prior `alloc`/`realloc` on
    /// this heap and not yet freed.
    unsafe fn header_of(payload: *mut u8) -> *mut ChunkHeader {
        payload.sub(HEADER_SIZE) as *mut ChunkHeader
    }

    fn alloc(&mut self, n: usize) -> *mut u8 {
        if n == 0 {
            crate::internal_error!("heap alloc of zero bytes");
        }
        self.ensure_init();

        let size = round_up8(n);
        let total = size + HEADER_SIZE;

        let mut cur = self.head;
        while !cur.is_null() {
            let chunk = unsafe { &mut *cur };
            if !chunk.allocated && chunk.size >= total {
                let leftover = chunk.size - total;
                if leftover >= total + HEADER_SIZE {
                    // Split: shrink this chunk, insert a fresh free chunk after it.
                    unsafe {
                        let new_free = (cur as *mut u8).add(total) as *mut ChunkHeader;
                        (*new_free).size = leftover;
                        (*new_free).allocated = false;
                        (*new_free).prev = cur;
                        (*new_free).next = chunk.next;
                        if !chunk.next.is_null() {
                            (*chunk.next).prev = new_free;
                        }
                        chunk.next = new_free;
                        chunk.size = total;
                    }
                }
                chunk.allocated = true;
                return unsafe { Self::payload_of(cur) };
            }
            cur = chunk.next;
        }

        crate::internal_error!("heap exhausted: requested {} bytes", n);
    }

    fn free(&mut self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        let header = unsafe { Self::header_of(p) };
        let chunk = unsafe { &mut *header };
        if !chunk.allocated {
            crate::internal_error!("double free at {:p}", p);
        }
        chunk.allocated = false;

        // Coalesce with the next neighbor first, then the previous one —
        // two adjacent free chunks must never coexist.
        let next = chunk.next;
        if !next.is_null() && unsafe { !(*next).allocated } {
            debug_assert_eq!(
                header as usize + chunk.size,
                next as usize,
                "heap corruption: chunk not address-adjacent to its next link"
            );
            unsafe {
                chunk.size += (*next).size;
                chunk.next = (*next).next;
                if !chunk.next.is_null() {
                    (*chunk.next).prev = header;
                }
            }
        }

        let prev = chunk.prev;
        if !prev.is_null() && unsafe { !(*prev).allocated } {
            let prev_ref = unsafe { &mut *prev };
            debug_assert_eq!(
                prev as usize + prev_ref.size,
                header as usize,
                "heap corruption: chunk not address-adjacent to its prev link"
            );
            prev_ref.size += chunk.size;
            prev_ref.next = chunk.next;
            if !chunk.next.is_null() {
                unsafe {
                    (*chunk.next).prev = prev;
                }
            }
        }
    }

    fn realloc(&mut self, p: *mut u8, n: usize) -> *mut u8 {
        if n == 0 {
            self.free(p);
            return ptr::null_mut();
        }
        if p.is_null() {
            return self.alloc(n);
        }

        let header = unsafe { Self::header_of(p) };
        let payload_capacity = unsafe { (*header).size } - HEADER_SIZE;
        let rounded = round_up8(n);
        if rounded == payload_capacity {
            return p;
        }

        let new_ptr = self.alloc(n);
        let copy_len = core::cmp::min(payload_capacity, n);
        unsafe {
            ptr::copy_nonoverlapping(p, new_ptr, copy_len);
        }
        self.free(p);
        new_ptr
    }
}

/// A fixed-size intra-loader heap. `N` is the backing region size in bytes;
/// production code uses the default-sized [`Heap::new`], tests instantiate
/// smaller, independent heaps.
pub struct Heap<const N: usize = HEAP_SIZE> {
    inner: Mutex<HeapInner<N>>,
}

impl<const N: usize> Heap<N> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(HeapInner::new()),
        }
    }

    /// Allocate `n` bytes. `n == 0` is a programmer bug.
    pub fn alloc(&self, n: usize) -> *mut u8 {
        self.inner.lock().alloc(n)
    }

    /// Free a pointer previously returned by `alloc`/`realloc` on this heap.
    /// `p == null` is a no-op; freeing an already-free chunk is fatal.
    pub fn free(&self, p: *mut u8) {
        self.inner.lock().free(p)
    }

    /// Resize an allocation in place when possible, otherwise move it.
    /// `n == 0` behaves like `free`; `p == null` behaves like `alloc`.
    pub fn realloc(&self, p: *mut u8, n: usize) -> *mut u8 {
        self.inner.lock().realloc(p, n)
    }
}

unsafe impl<const N: usize> GlobalAlloc for Heap<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        debug_assert!(
            layout.align() <= 8,
            "heap chunks are only guaranteed 8-byte alignment"
        );
        if layout.size() == 0 {
            return layout.align() as *mut u8;
        }
        self.alloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        self.realloc(ptr, new_size)
    }
}

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: Heap = Heap::new();

/// Boot-time self-test cases for the heap, run from a platform's init path
/// (see [`crate::self_test`]) before anything else trusts this allocator.
/// Exercises the same invariants as the `#[cfg(test)]` suite below, but
/// against an isolated local heap rather than the host test harness.
#[cfg(feature = "self_test")]
pub mod self_test {
    use super::Heap;
    use crate::self_test::TestCase;

    crate::ktest!(first_fit_reuse_after_free, {
        let heap: Heap<4096> = Heap::new();
        let p = heap.alloc(24);
        let q = heap.alloc(24);
        heap.free(p);
        let r = heap.alloc(24);
        crate::kassert_eq!(r, p);
        crate::kassert!(q != r);
    });

    crate::ktest!(coalesce_restores_capacity, {
        let heap: Heap<4096> = Heap::new();
        let a = heap.alloc(32);
        let b = heap.alloc(32);
        heap.free(a);
        heap.free(b);
        let big = heap.alloc(96);
        crate::kassert!(!big.is_null());
    });

    pub const CASES: &[TestCase] = &[
        TestCase::new("heap::first_fit_reuse_after_free", first_fit_reuse_after_free),
        TestCase::new("heap::coalesce_restores_capacity", coalesce_restores_capacity),
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> Heap<4096> {
        Heap::new()
    }

    #[test]
    fn first_alloc_returns_nonnull_and_writable() {
        let heap = small_heap();
        let p = heap.alloc(24);
        assert!(!p.is_null());
        unsafe {
            core::ptr::write_bytes(p, 0xAB, 24);
        }
    }

    #[test]
    fn alloc_is_8_byte_aligned() {
        let heap = small_heap();
        for n in [1usize, 7, 8, 9, 100] {
            let p = heap.alloc(n);
            assert_eq!((p as usize) % 8, 0);
        }
    }

    #[test]
    fn alloc_free_alloc_reuses_freed_chunk() {
        let heap = small_heap();
        let p = heap.alloc(24);
        let q = heap.alloc(24);
        heap.free(p);
        let r = heap.alloc(24);
        assert_eq!(r, p, "freed chunk should be reused by first-fit");
        assert_ne!(q, r);
    }

    #[test]
    fn free_then_alloc_same_size_reuses_exact_chunk() {
        let heap = small_heap();
        let p = heap.alloc(64);
        heap.free(p);
        let q = heap.alloc(64);
        assert_eq!(p, q);
    }

    #[test]
    fn coalesces_both_neighbors_on_free() {
        let heap = small_heap();
        let a = heap.alloc(32);
        let b = heap.alloc(32);
        heap.free(a);
        heap.free(b);
        // The coalesced free space should now satisfy an allocation that
        // didn't fit before the merge (bigger than either half alone).
        let big = heap.alloc(96);
        assert!(!big.is_null());
    }

    #[test]
    fn null_free_is_noop() {
        let heap = small_heap();
        heap.free(core::ptr::null_mut());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let heap = small_heap();
        let p = heap.alloc(16);
        heap.free(p);
        heap.free(p);
    }

    #[test]
    #[should_panic(expected = "zero bytes")]
    fn zero_size_alloc_is_fatal() {
        let heap = small_heap();
        heap.alloc(0);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn oversized_alloc_is_fatal() {
        let heap = small_heap();
        heap.alloc(1 << 20);
    }

    #[test]
    fn realloc_null_is_alloc() {
        let heap = small_heap();
        let p = heap.realloc(core::ptr::null_mut(), 32);
        assert!(!p.is_null());
    }

    #[test]
    fn realloc_zero_is_free() {
        let heap = small_heap();
        let p = heap.alloc(32);
        let r = heap.realloc(p, 0);
        assert!(r.is_null());
    }

    #[test]
    fn realloc_same_rounded_size_is_identity() {
        let heap = small_heap();
        let p = heap.alloc(32);
        let q = heap.realloc(p, 30); // rounds to the same 32-byte payload
        assert_eq!(p, q);
    }

    #[test]
    fn realloc_preserves_contents_on_move() {
        let heap = small_heap();
        let p = heap.alloc(16);
        unsafe {
            core::ptr::write_bytes(p, 0x42, 16);
        }
        let q = heap.realloc(p, 512);
        assert_ne!(p, q);
        unsafe {
            for i in 0..16 {
                assert_eq!(*q.add(i), 0x42);
            }
        }
    }

    #[test]
    fn split_leaves_remainder_available() {
        let heap = small_heap();
        let p = heap.alloc(16);
        let q = heap.alloc(16);
        assert_ne!(p, q);
        assert!((q as usize) > (p as usize));
    }
}
