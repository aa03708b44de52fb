//! The bulk allocator (BA) services allocations too large for a
//! bucket slot (more than [`crate::size_class::MAX_BUCKET`] bytes) but
//! small enough to fit comfortably inside one arena: a coalescing
//! free-list allocator over contiguous page runs, with every chunk's
//! bookkeeping written directly into the chunk's own first 16 bytes.
//!
//! There is no side table. A chunk's boundary tag is read by following
//! the pointer the caller already has; coalescing walks to the chunk's
//! neighbours by arithmetic on that same pointer, never by consulting
//! a registry.
//!
//! [`BA_RESERVED_PREFIX`] (`size_of::<BoundaryTag>()`) is the number of
//! bytes the dispatcher reserves at the front of every BA request for
//! this tag; see `DESIGN.md` for why it is 32 bytes rather than the 16
//! a `prev_chunk`/`next_chunk`-only tag would need.
#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
use contracts::*;
#[cfg(not(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts")))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::packed_ptr::PackedPtr;
use crate::page_cache::PageCache;
use crate::sapa::RESERVATION;
use crate::vm::{Mapper, PAGE_SIZE};

/// Largest chunk size (in pages) tracked by a dedicated free list;
/// requests above this bypass the arena and go straight to the VM.
pub const BA_MAX_PAGES: usize = 32;

/// One more than [`BA_MAX_PAGES`]: the "oversize tail" list, index 32,
/// holds every free chunk bigger than `BA_MAX_PAGES` pages (arena-
/// initial chunks, and remainders of splits too big to be reclassified
/// into a fixed-size list).
const FREE_LIST_COUNT: usize = BA_MAX_PAGES + 1;

const PAGES_PER_ARENA: usize = RESERVATION / PAGE_SIZE;

/// The header written at the start of every BA chunk.
///
/// `prev`/`next` are page-aligned pointers to the neighbouring chunks
/// within the same arena (`None` at an arena edge); their low bits
/// carry `page_count` and `is_free` respectively, via [`PackedPtr`].
/// For a direct-VM chunk (`page_count == 0`), `prev`'s *pointer* half
/// is unused and its full word instead holds the chunk's true byte
/// size — the one context on this path where `prev` is not itself a
/// pointer.
#[repr(C)]
struct BoundaryTag {
    prev: PackedPtr,
    next: PackedPtr,
    prev_free: Option<NonNull<c_void>>,
    next_free: Option<NonNull<c_void>>,
}

const TAG_SIZE: usize = std::mem::size_of::<BoundaryTag>();

/// Bytes consumed by a chunk's boundary tag; the bucket dispatcher
/// folds this into every BA request and returns the pointer just past
/// it to the caller (§4.3.3). Free-list links occupy the rest of the
/// tag but only while the chunk is free, so this is the one offset
/// user data is guaranteed never to overlap.
pub const BA_RESERVED_PREFIX: usize = TAG_SIZE;

#[inline(always)]
unsafe fn tag_at(chunk: NonNull<c_void>) -> *mut BoundaryTag {
    chunk.as_ptr() as *mut BoundaryTag
}

#[inline(always)]
fn chunk_add_pages(chunk: NonNull<c_void>, pages: usize) -> NonNull<c_void> {
    NonNull::new((chunk.as_ptr() as usize + pages * PAGE_SIZE) as *mut c_void).unwrap()
}

fn free_list_index(pages: usize) -> usize {
    debug_assert!(pages >= 1);
    (pages - 1).min(BA_MAX_PAGES)
}

/// One BA arena: a 2048-page reservation whose chunk list always sums
/// to exactly 2048 pages (the tiling invariant).
struct Arena {
    base: NonNull<c_void>,
}

/// A coalescing free-list allocator over 8 MiB arenas of page-sized
/// chunks. See the module docs for the boundary-tag layout.
pub struct BulkAllocator<'m> {
    mapper: &'m dyn Mapper,
    page_cache: PageCache,
    arenas: Vec<Arena>,
    /// `free_lists[k]` for `k < BA_MAX_PAGES` holds chunks of exactly
    /// `k + 1` pages; `free_lists[BA_MAX_PAGES]` is the oversize tail.
    free_lists: [Option<NonNull<c_void>>; FREE_LIST_COUNT],
}

impl<'m> BulkAllocator<'m> {
    pub fn new(mapper: &'m dyn Mapper) -> Self {
        Self {
            mapper,
            page_cache: PageCache::new(RESERVATION),
            arenas: Vec::new(),
            free_lists: [None; FREE_LIST_COUNT],
        }
    }

    /// Allocates a chunk covering at least `size` bytes (including any
    /// header the caller folds in), rounded up to whole pages. Returns
    /// the page-aligned chunk start; aborts the process on exhaustion.
    #[ensures(!self.is_free(ret), "a freshly allocated chunk must not be marked free")]
    #[ensures({ self.check_invariants(); true }, "arena tiling holds after allocation")]
    pub fn allocate(&mut self, size: usize) -> NonNull<c_void> {
        let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        assert!(pages >= 1, "zero-page allocation");

        if pages > BA_MAX_PAGES {
            return self.allocate_direct(pages * PAGE_SIZE);
        }

        let exact = free_list_index(pages);
        if let Some(chunk) = self.pop_free(exact) {
            self.set_free(chunk, false);
            return chunk;
        }

        self.refill_oversize();
        let head = self
            .pop_free(BA_MAX_PAGES)
            .expect("oversize tail refilled but still empty");
        self.carve(head, pages)
    }

    /// Splits `head` (a free chunk of >= `pages` pages) into an
    /// allocated chunk of exactly `pages` pages and pushes any
    /// remainder back onto the appropriate free list.
    fn carve(&mut self, head: NonNull<c_void>, pages: usize) -> NonNull<c_void> {
        let head_pages = unsafe { (*tag_at(head)).prev.tag() };
        debug_assert!(head_pages >= pages);

        let remainder_pages = head_pages - pages;
        if remainder_pages == 0 {
            self.set_page_count(head, pages);
            self.set_free(head, false);
            return head;
        }

        let remainder = chunk_add_pages(head, pages);
        self.relink_split(head, pages, remainder, remainder_pages);

        self.set_free(head, false);
        self.set_free(remainder, true);
        self.push_free(free_list_index(remainder_pages), remainder);
        head
    }

    /// Rewrites the arena-neighbour chain after splitting `head` (now
    /// `head_pages` pages) into `head` followed by `tail`
    /// (`tail_pages` pages), preserving the outer neighbours.
    fn relink_split(
        &mut self,
        head: NonNull<c_void>,
        head_pages: usize,
        tail: NonNull<c_void>,
        tail_pages: usize,
    ) {
        unsafe {
            let head_tag = tag_at(head);
            let old_next = (*head_tag).next.ptr();

            (*head_tag).next = PackedPtr::new(Some(tail), 0);
            self.set_page_count(head, head_pages);

            let tail_tag = tag_at(tail);
            (*tail_tag).prev = PackedPtr::new(Some(head), tail_pages);
            (*tail_tag).next = PackedPtr::new(old_next, 0);
            (*tail_tag).prev_free = None;
            (*tail_tag).next_free = None;

            if let Some(next) = old_next {
                (*tag_at(next)).prev = PackedPtr::new(Some(tail), (*tag_at(next)).prev.tag());
            }
        }
    }

    fn allocate_direct(&mut self, bytes: usize) -> NonNull<c_void> {
        let pages = (bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        let size = pages * PAGE_SIZE;
        log::trace!("BA direct-VM allocation of {} pages ({} bytes)", pages, size);
        let chunk = self
            .mapper
            .reserve(size)
            .unwrap_or_else(|errno| panic!("BA direct reservation failed: errno {}", errno));
        self.mapper
            .commit(chunk, size)
            .unwrap_or_else(|errno| panic!("BA direct commit failed: errno {}", errno));

        unsafe {
            let tag = tag_at(chunk);
            // `page_count == 0` is the direct-VM sentinel; `prev`'s
            // pointer half is unused, so its whole word carries the
            // true byte size instead.
            (*tag).prev = PackedPtr::new(None, 0);
            std::ptr::write(&mut (*tag).prev as *mut PackedPtr as *mut usize, size);
            (*tag).next = PackedPtr::new(None, 0);
            (*tag).prev_free = None;
            (*tag).next_free = None;
        }
        chunk
    }

    /// Returns `chunk` (as produced by a prior `allocate`) to the
    /// pool, coalescing with free neighbours in the same arena.
    #[requires(!self.is_free(chunk), "a chunk must not already be free when deallocated")]
    #[ensures({ self.check_invariants(); true }, "arena tiling holds after deallocation")]
    pub fn deallocate(&mut self, chunk: NonNull<c_void>) {
        let page_count = unsafe { (*tag_at(chunk)).prev.tag() };
        if page_count == 0 {
            let size = unsafe { std::ptr::read(tag_at(chunk) as *const usize) };
            self.mapper
                .release(chunk, size)
                .unwrap_or_else(|errno| panic!("BA direct release failed: errno {}", errno));
            return;
        }

        let mut merged = chunk;
        let mut merged_pages = page_count;

        unsafe {
            if let Some(prev) = (*tag_at(chunk)).prev.ptr() {
                if self.is_free(prev) {
                    let prev_pages = (*tag_at(prev)).prev.tag();
                    self.unlink_free(prev);
                    merged = prev;
                    merged_pages += prev_pages;
                }
            }
        }

        let next_of_original = unsafe { (*tag_at(chunk)).next.ptr() };
        let mut merged_next = next_of_original;
        if let Some(next) = next_of_original {
            if self.is_free(next) {
                let next_pages = unsafe { (*tag_at(next)).prev.tag() };
                self.unlink_free(next);
                merged_next = unsafe { (*tag_at(next)).next.ptr() };
                merged_pages += next_pages;
            }
        }

        unsafe {
            let prev_of_merged = (*tag_at(merged)).prev.ptr();
            let merged_tag = tag_at(merged);
            (*merged_tag).prev = PackedPtr::new(prev_of_merged, merged_pages);
            (*merged_tag).next = PackedPtr::new(merged_next, 0);
            if let Some(after) = merged_next {
                let after_tag = tag_at(after);
                let after_pages = (*after_tag).prev.tag();
                (*after_tag).prev = PackedPtr::new(Some(merged), after_pages);
            }
        }

        self.set_free(merged, true);
        self.push_free(free_list_index(merged_pages), merged);
    }

    /// Reserves (or pulls from the page cache) a fresh arena and seeds
    /// the oversize tail with its single initial 2048-page chunk, if
    /// the tail is currently empty.
    fn refill_oversize(&mut self) {
        if self.free_lists[BA_MAX_PAGES].is_some() {
            return;
        }

        let base = self
            .page_cache
            .get_free_block(self.mapper)
            .unwrap_or_else(|errno| panic!("BA arena reservation failed: errno {}", errno));
        // Unlike SAPA, BA commits an entire arena up front: chunk
        // boundary tags can land anywhere in it as splits and merges
        // move chunk starts around, so partial commit has no stable
        // "prefix" to bound it to.
        self.mapper
            .commit(base, RESERVATION)
            .unwrap_or_else(|errno| panic!("BA arena commit failed: errno {}", errno));
        log::debug!("BA arena #{} ready at {:p}", self.arenas.len(), base.as_ptr());

        unsafe {
            let tag = tag_at(base);
            (*tag).prev = PackedPtr::new(None, PAGES_PER_ARENA);
            (*tag).next = PackedPtr::new(None, 0);
            (*tag).prev_free = None;
            (*tag).next_free = None;
        }

        self.arenas.push(Arena { base });
        self.set_free(base, true);
        self.push_free(BA_MAX_PAGES, base);
    }

    fn set_page_count(&mut self, chunk: NonNull<c_void>, pages: usize) {
        unsafe {
            let tag = tag_at(chunk);
            let prev_ptr = (*tag).prev.ptr();
            (*tag).prev = PackedPtr::new(prev_ptr, pages);
        }
    }

    fn is_free(&self, chunk: NonNull<c_void>) -> bool {
        unsafe { (*tag_at(chunk)).next.tag() != 0 }
    }

    fn set_free(&mut self, chunk: NonNull<c_void>, free: bool) {
        unsafe {
            let tag = tag_at(chunk);
            let next_ptr = (*tag).next.ptr();
            (*tag).next = PackedPtr::new(next_ptr, if free { 1 } else { 0 });
        }
    }

    fn push_free(&mut self, list: usize, chunk: NonNull<c_void>) {
        unsafe {
            let tag = tag_at(chunk);
            (*tag).prev_free = None;
            (*tag).next_free = self.free_lists[list];
            if let Some(old_head) = self.free_lists[list] {
                (*tag_at(old_head)).prev_free = Some(chunk);
            }
        }
        self.free_lists[list] = Some(chunk);
    }

    fn pop_free(&mut self, list: usize) -> Option<NonNull<c_void>> {
        let head = self.free_lists[list]?;
        self.unlink_free(head);
        Some(head)
    }

    fn unlink_free(&mut self, chunk: NonNull<c_void>) {
        unsafe {
            let tag = tag_at(chunk);
            let prev_free = (*tag).prev_free;
            let next_free = (*tag).next_free;

            match prev_free {
                Some(p) => (*tag_at(p)).next_free = next_free,
                None => {
                    let pages = (*tag).prev.tag();
                    let list = free_list_index(pages);
                    if self.free_lists[list] == Some(chunk) {
                        self.free_lists[list] = next_free;
                    }
                }
            }
            if let Some(n) = next_free {
                (*tag_at(n)).prev_free = prev_free;
            }
            (*tag).prev_free = None;
            (*tag).next_free = None;
        }
    }

    /// Releases every arena to the VM shim. Only called from
    /// `deinitialize`; leaves free lists pointing at freed memory, so
    /// the allocator must not be used afterwards without a fresh
    /// `BulkAllocator::new`.
    pub fn deinitialize(&mut self) {
        self.free_lists = [None; FREE_LIST_COUNT];
        for arena in self.arenas.drain(..) {
            self.mapper
                .release(arena.base, RESERVATION)
                .unwrap_or_else(|errno| panic!("BA arena release failed: errno {}", errno));
        }
        self.page_cache
            .drain(self.mapper)
            .unwrap_or_else(|errno| panic!("BA page cache drain failed: errno {}", errno));
    }

    /// Debug-mode invariant walk: no two adjacent chunks are both
    /// free, every arena's chunks sum to [`PAGES_PER_ARENA`], and
    /// every free list holds chunks of the right size, all marked
    /// free. Intended for `#[cfg(test)]`/contract-checked builds.
    #[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
    pub fn check_invariants(&self) {
        for arena in &self.arenas {
            let mut cursor = Some(arena.base);
            let mut total_pages = 0usize;
            let mut prev_was_free = false;
            while let Some(chunk) = cursor {
                let pages = unsafe { (*tag_at(chunk)).prev.tag() };
                let free = self.is_free(chunk);
                assert!(!(prev_was_free && free), "adjacent free chunks");
                total_pages += pages;
                prev_was_free = free;
                cursor = unsafe { (*tag_at(chunk)).next.ptr() };
            }
            assert_eq!(total_pages, PAGES_PER_ARENA, "arena chunk list does not tile");
        }

        for (list, &head) in self.free_lists.iter().enumerate() {
            let mut cursor = head;
            while let Some(chunk) = cursor {
                assert!(self.is_free(chunk), "free-list chunk not marked free");
                let pages = unsafe { (*tag_at(chunk)).prev.tag() };
                if list < BA_MAX_PAGES {
                    assert_eq!(pages, list + 1, "free-list {} holds wrong size", list);
                } else {
                    assert!(pages > BA_MAX_PAGES, "oversize tail holds small chunk");
                }
                cursor = unsafe { (*tag_at(chunk)).next_free };
            }
        }
    }
}

impl Drop for BulkAllocator<'_> {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vm::SystemMapper;

    #[test]
    fn allocate_then_deallocate_round_trips() {
        let _ = env_logger::try_init();
        let mapper = SystemMapper::default();
        let mut ba = BulkAllocator::new(&mapper);

        let chunk = ba.allocate(3 * PAGE_SIZE);
        ba.check_invariants();
        ba.deallocate(chunk);
        ba.check_invariants();
    }

    #[test]
    fn coalesces_neighbours_back_to_one_arena_chunk() {
        let _ = env_logger::try_init();
        let mapper = SystemMapper::default();
        let mut ba = BulkAllocator::new(&mapper);

        let a = ba.allocate(5 * PAGE_SIZE);
        let b = ba.allocate(3 * PAGE_SIZE);
        let c = ba.allocate(7 * PAGE_SIZE);
        ba.check_invariants();

        ba.deallocate(b);
        ba.deallocate(a);
        ba.check_invariants();
        assert!(ba.free_lists[7].is_some(), "5+3 should coalesce into an 8-page chunk");

        ba.deallocate(c);
        ba.check_invariants();
        assert!(
            ba.free_lists[BA_MAX_PAGES].is_some(),
            "freeing the last live chunk should restore the single-arena tail"
        );
    }

    #[test]
    fn direct_vm_path_for_oversize_requests() {
        let _ = env_logger::try_init();
        let mapper = SystemMapper::default();
        let mut ba = BulkAllocator::new(&mapper);

        let big = ba.allocate(200 * PAGE_SIZE);
        let page_count = unsafe { (*tag_at(big)).prev.tag() };
        assert_eq!(page_count, 0, "oversize chunk must carry the sentinel");

        ba.deallocate(big);
        assert!(ba.arenas.is_empty(), "direct path must not touch arena bookkeeping");
    }
}
