//! Debug-only bookkeeping that shadows the allocator's real state to
//! catch protocol violations: double allocation, double free, and
//! deallocating a pointer this instance never handed out.
//!
//! This is pure overhead kept for `check_contracts`/
//! `check_contracts_in_tests` builds; release builds never construct
//! an [`AllocationTracker`]. Unlike Slitter's version of this, which
//! shadows a global thread-local singleton through a `Mutex`-guarded
//! map, this tracker is owned by the `Dispatcher` it checks — there is
//! nothing to lock, since both sides are single-threaded per instance.
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;

/// `None` means this address currently belongs to the bulk allocator
/// rather than a bucket class; `Some(idx)` names the bucket class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AllocationInfo {
    class: Option<u8>,
    live: bool,
}

#[derive(Default)]
pub struct AllocationTracker {
    state: HashMap<usize, AllocationInfo>,
}

impl AllocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `p` was just handed to the caller as a member of
    /// `class` (`None` for a BA chunk). Panics on a protocol
    /// violation: double allocation or a class mismatch against a
    /// prior recorded allocation at this address.
    pub fn mark_allocated(&mut self, p: NonNull<c_void>, class: Option<u8>) {
        let info = self
            .state
            .entry(p.as_ptr() as usize)
            .or_insert(AllocationInfo { class, live: false });

        assert_eq!(info.class, class, "address reused across size classes");
        assert!(!info.live, "double allocation at {:p}", p);
        info.live = true;
        info.class = class;
    }

    /// Records that `p` was just returned by the caller. Panics if `p`
    /// is unknown to this tracker or was already free.
    pub fn mark_released(&mut self, p: NonNull<c_void>, class: Option<u8>) {
        let info = self
            .state
            .get_mut(&(p.as_ptr() as usize))
            .unwrap_or_else(|| panic!("released address never allocated: {:p}", p));

        assert_eq!(info.class, class, "address released under the wrong class");
        assert!(info.live, "double free at {:p}", p);
        info.live = false;
    }

    /// Number of addresses currently marked live. Exposed for tests
    /// that want to confirm a churn sequence left nothing outstanding.
    pub fn live_count(&self) -> usize {
        self.state.values().filter(|info| info.live).count()
    }

    /// Read-only query for contract predicates: does `p` currently
    /// show as live, without mutating or panicking. Used from
    /// `#[ensures]`/`#[requires]` annotations, which must not have
    /// side effects of their own.
    pub fn is_live(&self, p: NonNull<c_void>) -> bool {
        self.state
            .get(&(p.as_ptr() as usize))
            .map_or(false, |info| info.live)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(a: usize) -> NonNull<c_void> {
        NonNull::new(a as *mut c_void).unwrap()
    }

    #[test]
    fn tracks_allocate_then_free() {
        let mut t = AllocationTracker::new();
        t.mark_allocated(addr(0x1000), Some(3));
        assert_eq!(t.live_count(), 1);
        t.mark_released(addr(0x1000), Some(3));
        assert_eq!(t.live_count(), 0);
    }

    #[test]
    #[should_panic(expected = "double allocation")]
    fn double_allocation_panics() {
        let mut t = AllocationTracker::new();
        t.mark_allocated(addr(0x1000), Some(3));
        t.mark_allocated(addr(0x1000), Some(3));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut t = AllocationTracker::new();
        t.mark_allocated(addr(0x1000), None);
        t.mark_released(addr(0x1000), None);
        t.mark_released(addr(0x1000), None);
    }

    #[test]
    #[should_panic(expected = "never allocated")]
    fn releasing_unknown_address_panics() {
        let mut t = AllocationTracker::new();
        t.mark_released(addr(0x2000), None);
    }
}
