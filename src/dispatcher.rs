//! The bucket dispatcher (BD) is the allocator's public face: it owns
//! the size-class free lists, carves fresh bucket pages from
//! [`crate::sapa`], routes oversize requests to [`crate::bulk`], and —
//! on the way back in — tells the two apart for a bare pointer with a
//! single offset comparison, no header read.
#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
use contracts::*;
#[cfg(not(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts")))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::bulk::{BulkAllocator, BA_RESERVED_PREFIX};
use crate::sapa::{address_to_class, Sapa, PAGES_PER_BUCKET};
use crate::size_class::{class_size, size_to_index, BUCKET_COUNT, LAST_BUCKETED_CLASS, MAX_BUCKET};
use crate::stats::BlockStats;
use crate::vm::{host_page_size, Mapper, PAGE_SIZE};

#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
use crate::debug_checks::AllocationTracker;

/// Bucket slots are carved starting at this in-page offset. The
/// address-directed dispatch in `deallocate` tells a bucket slot from
/// a BA chunk by a single `offset > BA_RESERVED_PREFIX` test, which is
/// only sound if no bucket slot's offset can fall at or below
/// `BA_RESERVED_PREFIX`; fixing it one alignment step above
/// `BA_RESERVED_PREFIX` (rather than equal to it, as a same-value
/// reading of the design note's "prefixes must be equal" would give)
/// keeps the boundary slot itself on the correct side of that test —
/// see `DESIGN.md`. Asserted at `Dispatcher::new`.
const SAPA_RESERVED_PREFIX: usize = BA_RESERVED_PREFIX + crate::ALIGNMENT;

#[inline(always)]
unsafe fn read_next(slot: NonNull<c_void>) -> Option<NonNull<c_void>> {
    NonNull::new(*(slot.as_ptr() as *const *mut c_void))
}

#[inline(always)]
unsafe fn write_next(slot: NonNull<c_void>, next: Option<NonNull<c_void>>) {
    *(slot.as_ptr() as *mut *mut c_void) = next.map_or(std::ptr::null_mut(), |p| p.as_ptr());
}

/// Owns every structure needed to service `allocate`/`deallocate` for
/// one thread: the per-class slot free lists, the page allocator they
/// draw from, and the bulk allocator for anything bigger.
pub struct Dispatcher<'m> {
    sapa: Sapa<'m>,
    ba: BulkAllocator<'m>,
    /// Head of each size class's LIFO slot free list. Classes above
    /// `LAST_BUCKETED_CLASS` stay permanently `None`.
    free_lists: [Option<NonNull<c_void>>; BUCKET_COUNT],
    stats: BlockStats,
    #[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
    tracker: AllocationTracker,
}

impl<'m> Dispatcher<'m> {
    pub fn new(mapper: &'m dyn Mapper) -> Self {
        // The single branch `deallocate` uses to route a pointer is
        // only sound if every bucket slot's offset is strictly above
        // BA_RESERVED_PREFIX (§9 open question); assert it once up
        // front rather than per-call.
        assert!(
            SAPA_RESERVED_PREFIX > BA_RESERVED_PREFIX,
            "SAPA reserved prefix must exceed BA's for the offset dispatch to be branch-free"
        );

        // Every exponent in `size_class`/`sapa`/`vm` assumes PAGE_SIZE;
        // fail fast here rather than silently corrupting every page
        // computation if the running kernel disagrees (§6).
        assert_eq!(
            host_page_size(),
            PAGE_SIZE,
            "host page size does not match the allocator's compiled-in PAGE_SIZE"
        );

        Self {
            sapa: Sapa::new(mapper),
            ba: BulkAllocator::new(mapper),
            free_lists: [None; BUCKET_COUNT],
            stats: BlockStats::default(),
            #[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
            tracker: AllocationTracker::new(),
        }
    }

    /// Returns a pointer to at least `sz` bytes, aligned to
    /// [`crate::ALIGNMENT`]. Aborts the process on exhaustion.
    #[ensures(self.tracker.is_live(ret), "every pointer allocate returns must be live")]
    pub fn allocate(&mut self, sz: usize) -> NonNull<c_void> {
        let sz = sz.max(1);

        let (p, class) = if sz <= MAX_BUCKET {
            let idx = size_to_index(sz);
            (self.allocate_bucketed(idx), Some(idx))
        } else {
            let chunk = self.ba.allocate(sz + BA_RESERVED_PREFIX);
            self.stats.record_ba_allocation(sz + BA_RESERVED_PREFIX);
            let p = unsafe {
                NonNull::new_unchecked((chunk.as_ptr() as usize + BA_RESERVED_PREFIX) as *mut c_void)
            };
            (p, None)
        };

        #[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
        self.tracker.mark_allocated(p, class);

        p
    }

    fn allocate_bucketed(&mut self, idx: u8) -> NonNull<c_void> {
        let i = idx as usize;
        if let Some(head) = self.free_lists[i] {
            let next = unsafe { read_next(head) };
            self.free_lists[i] = next;
            self.stats.record_bucket_allocation(idx);
            return head;
        }

        self.replenish(idx);
        let head = self.free_lists[i].take().expect("replenish must populate the free list");
        let next = unsafe { read_next(head) };
        self.free_lists[i] = next;
        self.stats.record_bucket_allocation(idx);
        head
    }

    /// Requests a fresh page from SAPA for class `idx`, carves it into
    /// slots, threads them into a free list, and installs that list as
    /// `free_lists[idx]`.
    fn replenish(&mut self, idx: u8) {
        let page = self.sapa.get_page(idx);
        let slot_size = class_size(idx);
        let usable = PAGE_SIZE - SAPA_RESERVED_PREFIX;
        let slot_count = usable / slot_size;
        debug_assert!(slot_count >= 1, "class {} slot too large for a page", idx);

        let page_addr = page.as_ptr() as usize + SAPA_RESERVED_PREFIX;

        let mut head: Option<NonNull<c_void>> = None;
        for slot_idx in (0..slot_count).rev() {
            let addr = (page_addr + slot_idx * slot_size) as *mut c_void;
            let slot = NonNull::new(addr).expect("slot address is never null");
            unsafe { write_next(slot, head) };
            head = Some(slot);
        }

        self.stats.record_sapa_page(idx, slot_count);
        self.free_lists[idx as usize] = head;
    }

    /// Releases `p`, a pointer previously returned by `allocate` on
    /// this same instance. A null pointer is a no-op; any other
    /// foreign pointer is undefined behaviour (§7).
    #[requires(
        p.map_or(true, |ptr| self.tracker.is_live(ptr)),
        "deallocate only accepts null or a pointer this instance still has live"
    )]
    pub fn deallocate(&mut self, p: Option<NonNull<c_void>>) {
        let p = match p {
            Some(p) => p,
            None => return,
        };

        let offset = (p.as_ptr() as usize) % PAGE_SIZE;
        if offset > BA_RESERVED_PREFIX {
            let idx = address_to_class(page_base(p));
            #[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
            self.tracker.mark_released(p, Some(idx));
            unsafe { write_next(p, self.free_lists[idx as usize]) };
            self.free_lists[idx as usize] = Some(p);
            self.stats.record_bucket_deallocation(idx);
        } else {
            #[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
            self.tracker.mark_released(p, None);
            let chunk_addr = (p.as_ptr() as usize) - BA_RESERVED_PREFIX;
            let chunk = NonNull::new(chunk_addr as *mut c_void).expect("chunk address is never null");
            self.stats.record_ba_deallocation();
            self.ba.deallocate(chunk);
        }
    }

    pub fn get_stats(&self) -> BlockStats {
        self.stats.clone()
    }

    /// Releases every SAPA and BA arena back to the VM shim.
    pub fn deinitialize(&mut self) {
        self.sapa.deinitialize();
        self.ba.deinitialize();
        self.free_lists = [None; BUCKET_COUNT];
        self.stats = BlockStats::default();
    }
}

#[inline(always)]
fn page_base(p: NonNull<c_void>) -> NonNull<c_void> {
    let addr = (p.as_ptr() as usize) & !(PAGE_SIZE - 1);
    NonNull::new(addr as *mut c_void).expect("page base is never null")
}

static_assertions::const_assert!(LAST_BUCKETED_CLASS as usize + 1 <= BUCKET_COUNT);

#[cfg(test)]
mod test {
    use super::*;
    use crate::vm::SystemMapper;
    use proptest::prelude::*;

    #[test]
    fn round_trip_every_size_class() {
        let mapper = SystemMapper::default();
        let mut bd = Dispatcher::new(&mapper);

        for sz in [1usize, 8, 9, 24, 64, 256, 257, 1024, 4096, 9000] {
            let p = bd.allocate(sz);
            bd.deallocate(Some(p));
        }
    }

    #[test]
    fn deallocate_null_is_a_no_op() {
        let mapper = SystemMapper::default();
        let mut bd = Dispatcher::new(&mapper);
        bd.deallocate(None);
    }

    #[test]
    fn address_dispatch_separates_bucket_and_ba_pointers() {
        let mapper = SystemMapper::default();
        let mut bd = Dispatcher::new(&mapper);

        let small = bd.allocate(24);
        let big = bd.allocate(10 * PAGE_SIZE);

        assert!((small.as_ptr() as usize) % PAGE_SIZE > BA_RESERVED_PREFIX);
        assert_eq!((big.as_ptr() as usize) % PAGE_SIZE, BA_RESERVED_PREFIX);

        bd.deallocate(Some(small));
        bd.deallocate(Some(big));
    }

    #[test]
    fn striping_six_sizes_land_in_six_distinct_classes() {
        let mapper = SystemMapper::default();
        let mut bd = Dispatcher::new(&mapper);

        let mut classes = std::collections::HashSet::new();
        for sz in [8usize, 16, 32, 64, 128, 256] {
            let p = bd.allocate(sz);
            let idx = address_to_class(page_base(p));
            assert_eq!(idx, size_to_index(sz));
            classes.insert(idx);
        }
        assert_eq!(classes.len(), 6);
    }

    /// Seed-test scenario 1: allocate 100 000 24-byte slots, deallocate
    /// in reverse order, and check the exact page count drawn from
    /// stripe 3 and that every one of those pages' slots is back on
    /// `free_lists[3]` afterwards.
    #[test]
    fn small_dense_churn_fills_and_drains_stripe_three() {
        let _ = env_logger::try_init();
        let mapper = SystemMapper::default();
        let mut bd = Dispatcher::new(&mapper);

        const SLOT_SIZE: usize = 24;
        const COUNT: usize = 100_000;

        let idx = size_to_index(SLOT_SIZE);
        assert_eq!(idx, 3, "24 bytes must land in size class 3");

        let slots_per_page = (PAGE_SIZE - SAPA_RESERVED_PREFIX) / class_size(idx);
        let expected_pages = (COUNT + slots_per_page - 1) / slots_per_page;

        let mut ptrs = Vec::with_capacity(COUNT);
        for _ in 0..COUNT {
            let p = bd.allocate(SLOT_SIZE);
            assert_eq!(address_to_class(page_base(p)), 3);
            ptrs.push(p);
        }

        let carved_slots = bd.stats.slots_carved[idx as usize] as usize;
        assert_eq!(
            carved_slots / slots_per_page,
            expected_pages,
            "stripe 3 should have been replenished exactly ceil(100000 * 24 / usable) times"
        );
        assert_eq!(carved_slots % slots_per_page, 0, "replenish always carves whole pages");

        for p in ptrs.into_iter().rev() {
            bd.deallocate(Some(p));
        }

        let mut free_count = 0usize;
        let mut cursor = bd.free_lists[idx as usize];
        while let Some(slot) = cursor {
            free_count += 1;
            cursor = unsafe { read_next(slot) };
        }
        assert_eq!(
            free_count, carved_slots,
            "every slot ever carved for stripe 3 must be back on its free list"
        );
    }

    /// Seed-test scenario 3: repeatedly `allocate(8)` through the
    /// public dispatcher until stripe 0's pages are exhausted; the
    /// allocation immediately past that point must force a second SAPA
    /// arena.
    #[test]
    fn arena_growth_triggers_on_the_allocation_after_stripe_exhaustion() {
        let _ = env_logger::try_init();
        let mapper = SystemMapper::default();
        let mut bd = Dispatcher::new(&mapper);

        let idx = size_to_index(8);
        assert_eq!(idx, 0, "8 bytes must land in size class 0");

        let slots_per_page = (PAGE_SIZE - SAPA_RESERVED_PREFIX) / class_size(idx);
        let stripe_capacity = PAGES_PER_BUCKET * slots_per_page;

        let mut ptrs = Vec::with_capacity(stripe_capacity + 1);
        for _ in 0..stripe_capacity {
            ptrs.push(bd.allocate(8));
        }
        assert_eq!(
            bd.sapa.arena_count(),
            1,
            "stripe 0 should still fit entirely in the first arena"
        );

        ptrs.push(bd.allocate(8));
        assert_eq!(
            bd.sapa.arena_count(),
            2,
            "the allocation past stripe 0's capacity must force a second arena"
        );

        for p in &ptrs {
            assert_eq!(address_to_class(page_base(*p)), 0);
        }
        for p in ptrs.into_iter().rev() {
            bd.deallocate(Some(p));
        }
    }

    proptest! {
        #[test]
        fn random_order_alloc_dealloc_never_panics(
            sizes in proptest::collection::vec(1usize..=4096, 1..64)
        ) {
            let mapper = SystemMapper::default();
            let mut bd = Dispatcher::new(&mapper);
            let ptrs: Vec<_> = sizes.iter().map(|&sz| bd.allocate(sz)).collect();
            for p in ptrs.into_iter().rev() {
                bd.deallocate(Some(p));
            }
        }
    }
}
