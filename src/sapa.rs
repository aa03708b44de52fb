//! The sounding-address page allocator (SAPA) hands out page-aligned
//! pages whose address alone identifies the size class they serve.
//!
//! Each arena is an 8 MiB reservation conceptually sliced into
//! [`crate::size_class::BUCKET_COUNT`] *stripes* of
//! [`PAGES_PER_BUCKET`] pages each; stripe `i` supplies every page
//! handed out for size class `i`.  Because an arena's base address is
//! only page-aligned, not 8-MiB-aligned, a stripe's pages are not
//! necessarily the first contiguous run after the arena base — they
//! are *rotated* so that stripe boundaries still line up with the
//! fixed bit window [`address_to_class`] reads back out.
use std::ffi::c_void;
use std::ptr::NonNull;

use static_assertions::const_assert;

use crate::size_class::{BUCKET_COUNT, BUCKET_COUNT_EXP};
use crate::vm::{Mapper, PAGE_SIZE, PAGE_SIZE_EXP};

/// log2 of pages per stripe.
pub const PAGES_PER_BUCKET_EXP: u32 = 7;
/// Pages in one stripe; also the number of pages handed out per class
/// before an arena rolls over to the next.
pub const PAGES_PER_BUCKET: usize = 1 << PAGES_PER_BUCKET_EXP;

/// log2 of the byte size of one arena.
pub const RESERVATION_SIZE_EXP: u32 = 23;
/// Byte size of one SAPA arena (8 MiB).
pub const RESERVATION: usize = 1 << RESERVATION_SIZE_EXP;

const_assert!(RESERVATION_SIZE_EXP >= BUCKET_COUNT_EXP + PAGE_SIZE_EXP + 1);

/// Pages per arena; also the modulus of the sounding-address window.
pub const PAGES_PER_ARENA: usize = RESERVATION / PAGE_SIZE;

static_assertions::const_assert_eq!(PAGES_PER_ARENA, BUCKET_COUNT * PAGES_PER_BUCKET);

/// log2 of pages committed per burst.
pub const COMMIT_PAGE_CNT_EXP: u32 = 2;
/// Pages committed from the OS at once, amortizing `mprotect` calls.
pub const COMMIT_GRANULARITY: usize = 1 << COMMIT_PAGE_CNT_EXP;

/// Mask over a page number that isolates the bits `address_to_class`
/// reads: `log2(PAGES_PER_ARENA)` bits wide.
const WINDOW_MASK: usize = PAGES_PER_ARENA - 1;

/// Recovers the size-class index that allocated `p` purely from its
/// address. Valid only for pointers actually handed out by
/// [`Sapa::get_page`] (or slots carved from such a page).
#[inline(always)]
pub fn address_to_class(p: NonNull<c_void>) -> u8 {
    let page = (p.as_ptr() as usize) >> PAGE_SIZE_EXP;
    ((page & WINDOW_MASK) >> PAGES_PER_BUCKET_EXP) as u8
}

/// Per-class progress within one arena.
#[derive(Debug)]
struct ArenaDescriptor {
    base: NonNull<c_void>,
    /// Pages of this arena handed out to callers, per class.
    next_to_use: [u32; BUCKET_COUNT],
    /// Pages of this arena committed from the OS, per class.
    next_to_commit: [u32; BUCKET_COUNT],
}

impl ArenaDescriptor {
    fn new(base: NonNull<c_void>) -> Self {
        Self {
            base,
            next_to_use: [0; BUCKET_COUNT],
            next_to_commit: [0; BUCKET_COUNT],
        }
    }

    fn base_page_mod_window(&self) -> usize {
        (self.base.as_ptr() as usize >> PAGE_SIZE_EXP) & WINDOW_MASK
    }

    /// Maps (class, logical page index within the stripe) to the
    /// arena-relative physical page offset, honouring stripe rotation.
    fn physical_offset(&self, class_idx: u8, logical: usize) -> usize {
        let base_mod = self.base_page_mod_window() as i64;
        let class_start = (class_idx as i64) * (PAGES_PER_BUCKET as i64);
        let start_k = (class_start - base_mod).rem_euclid(PAGES_PER_ARENA as i64) as usize;
        (start_k + logical) % PAGES_PER_ARENA
    }

    fn page_address(&self, class_idx: u8, logical: usize) -> NonNull<c_void> {
        let offset = self.physical_offset(class_idx, logical);
        let addr = (self.base.as_ptr() as usize) + offset * PAGE_SIZE;
        NonNull::new(addr as *mut c_void).expect("arena-relative address is never null")
    }
}

/// Owns every SAPA arena reserved so far and the per-class cursor
/// tracking which arena next supplies pages for that class.
pub struct Sapa<'m> {
    mapper: &'m dyn Mapper,
    arenas: Vec<ArenaDescriptor>,
    /// Index into `arenas` that each class is currently drawing from.
    current_arena: [usize; BUCKET_COUNT],
}

impl<'m> Sapa<'m> {
    pub fn new(mapper: &'m dyn Mapper) -> Self {
        Self {
            mapper,
            arenas: Vec::new(),
            current_arena: [0; BUCKET_COUNT],
        }
    }

    /// Returns a page-aligned, committed page satisfying the sounding
    /// invariant for `class_idx`. Aborts the process on VM exhaustion.
    pub fn get_page(&mut self, class_idx: u8) -> NonNull<c_void> {
        let idx = class_idx as usize;
        loop {
            let arena_idx = self.current_arena[idx];
            if arena_idx < self.arenas.len() {
                let next_to_use = self.arenas[arena_idx].next_to_use[idx] as usize;
                if next_to_use < PAGES_PER_BUCKET {
                    self.ensure_committed(arena_idx, class_idx, next_to_use);
                    let page = self.arenas[arena_idx].page_address(class_idx, next_to_use);
                    self.arenas[arena_idx].next_to_use[idx] = (next_to_use + 1) as u32;
                    return page;
                }
            }

            if arena_idx + 1 < self.arenas.len() {
                self.current_arena[idx] = arena_idx + 1;
                continue;
            }

            self.grow();
        }
    }

    /// Commits enough of the current commit burst to cover `next_to_use`,
    /// splitting the burst across the stripe's rotation discontinuity
    /// if it straddles the arena's physical wraparound point.
    fn ensure_committed(&mut self, arena_idx: usize, class_idx: u8, next_to_use: usize) {
        let idx = class_idx as usize;
        let next_to_commit = self.arenas[arena_idx].next_to_commit[idx] as usize;
        if next_to_use != next_to_commit {
            return;
        }

        let remaining = PAGES_PER_BUCKET - next_to_commit;
        let burst = remaining.min(COMMIT_GRANULARITY);

        let arena = &self.arenas[arena_idx];
        for (run_start, run_len) in contiguous_runs(arena, class_idx, next_to_commit, burst) {
            let addr = (arena.base.as_ptr() as usize) + run_start * PAGE_SIZE;
            let addr = NonNull::new(addr as *mut c_void).expect("commit address is never null");
            self.mapper
                .commit(addr, run_len * PAGE_SIZE)
                .unwrap_or_else(|errno| panic!("SAPA commit failed: errno {}", errno));
        }

        self.arenas[arena_idx].next_to_commit[idx] = (next_to_commit + burst) as u32;
    }

    fn grow(&mut self) {
        let base = self
            .mapper
            .reserve(RESERVATION)
            .unwrap_or_else(|errno| panic!("SAPA arena reservation failed: errno {}", errno));
        log::debug!(
            "SAPA reserved arena #{} at {:p}",
            self.arenas.len(),
            base.as_ptr()
        );
        self.arenas.push(ArenaDescriptor::new(base));
    }

    /// Number of arenas reserved so far. Exposed for tests driving this
    /// allocator from outside the module (e.g. through `Dispatcher`)
    /// that need to observe arena growth.
    pub(crate) fn arena_count(&self) -> usize {
        self.arenas.len()
    }

    /// Releases every arena back to the VM shim. Leaves the allocator
    /// empty; a subsequent `get_page` reserves fresh arenas.
    pub fn deinitialize(&mut self) {
        log::debug!("SAPA releasing {} arena(s)", self.arenas.len());
        for arena in self.arenas.drain(..) {
            self.mapper
                .release(arena.base, RESERVATION)
                .unwrap_or_else(|errno| panic!("SAPA arena release failed: errno {}", errno));
        }
        self.current_arena = [0; BUCKET_COUNT];
    }
}

impl Drop for Sapa<'_> {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

/// Groups `count` logical pages of `class_idx`, starting at `start`,
/// into maximal runs of physically contiguous arena offsets.
fn contiguous_runs(
    arena: &ArenaDescriptor,
    class_idx: u8,
    start: usize,
    count: usize,
) -> Vec<(usize, usize)> {
    let mut runs = Vec::with_capacity(2);
    let mut run_start = arena.physical_offset(class_idx, start);
    let mut run_len = 1;

    for logical in start + 1..start + count {
        let offset = arena.physical_offset(class_idx, logical);
        if offset == run_start + run_len {
            run_len += 1;
        } else {
            runs.push((run_start, run_len));
            run_start = offset;
            run_len = 1;
        }
    }
    if count > 0 {
        runs.push((run_start, run_len));
    }
    runs
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vm::SystemMapper;
    use proptest::prelude::*;

    #[test]
    fn sounding_invariant_holds_across_all_classes() {
        let _ = env_logger::try_init();
        let mapper = SystemMapper::default();
        let mut sapa = Sapa::new(&mapper);

        for class in 0u8..(BUCKET_COUNT as u8) {
            let page = sapa.get_page(class);
            assert_eq!(address_to_class(page), class, "class {}", class);
        }
    }

    #[test]
    fn striping_places_classes_in_distinct_stripes() {
        let _ = env_logger::try_init();
        let mapper = SystemMapper::default();
        let mut sapa = Sapa::new(&mapper);

        let mut stripes = std::collections::HashSet::new();
        for class in 0u8..(BUCKET_COUNT as u8) {
            let page = sapa.get_page(class);
            let page_no = page.as_ptr() as usize >> PAGE_SIZE_EXP;
            let stripe = (page_no & WINDOW_MASK) >> PAGES_PER_BUCKET_EXP;
            assert!(stripes.insert(stripe), "stripe {} reused", stripe);
        }
    }

    /// Unit-level check that `Sapa` itself rolls over to a second arena
    /// once a stripe's pages run out. `dispatcher`'s
    /// `arena_growth_triggers_on_the_allocation_after_stripe_exhaustion`
    /// drives the same growth through the public `allocate` path, at
    /// the slot granularity the seed-test scenario actually specifies.
    #[test]
    fn sapa_level_arena_growth_preserves_sounding_invariant() {
        let _ = env_logger::try_init();
        let mapper = SystemMapper::default();
        let mut sapa = Sapa::new(&mapper);

        // Exhaust stripe 0's pages, forcing a second arena.
        let mut pages = Vec::new();
        for _ in 0..(PAGES_PER_BUCKET + 4) {
            pages.push(sapa.get_page(0));
        }
        assert!(sapa.arenas.len() >= 2, "expected arena growth");
        for p in pages {
            assert_eq!(address_to_class(p), 0);
        }
    }

    proptest! {
        #[test]
        fn physical_offsets_within_one_arena_never_collide(
            base_mod in 0usize..PAGES_PER_ARENA,
            class in 0u8..(BUCKET_COUNT as u8),
        ) {
            let fake_base = (base_mod.max(1) << PAGE_SIZE_EXP) as *mut c_void;
            let arena = ArenaDescriptor::new(NonNull::new(fake_base).unwrap());

            let mut seen = std::collections::HashSet::new();
            for j in 0..PAGES_PER_BUCKET {
                let offset = arena.physical_offset(class, j);
                prop_assert!(seen.insert(offset));
                prop_assert!(offset < PAGES_PER_ARENA);
            }
        }
    }
}
