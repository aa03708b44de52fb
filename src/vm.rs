//! Rust bindings to the handful of `mmap`-family calls the allocator
//! needs: reserving address space, committing pages, and releasing a
//! range back to the OS.  This is the allocator's one external
//! collaborator that actually talks to the kernel; everything above
//! it only ever sees page-aligned addresses and byte counts.
use std::ffi::c_void;
use std::ptr::NonNull;

/// The page size this allocator is built for.  Every exponent in
/// `size_class` and `sapa` assumes this value; `page_size()` below
/// confirms the running kernel agrees.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE_EXP: u32 = 12;

static_assertions::const_assert_eq!(1 << PAGE_SIZE_EXP, PAGE_SIZE);

/// A `Mapper` is responsible for acquiring address space and backing
/// memory from the operating system.  The bucket dispatcher is built
/// against this trait, not against `mmap` directly, so that tests can
/// swap in a mapper that tracks every call.
pub trait Mapper: std::fmt::Debug {
    /// Returns the mapping granularity for this mapper.  Calls into
    /// the mapper assume all addresses and sizes are aligned to it.
    fn page_size(&self) -> usize;

    /// Reserves `size` bytes of address space.  `size` must be a
    /// non-zero multiple of `page_size()`.  The returned range is
    /// uncommitted: reads and writes to it fault until `commit`.
    ///
    /// # Errors
    ///
    /// Returns the OS `errno` on failure.  Callers treat this as
    /// fatal: there is no recovery from losing the race for address
    /// space.
    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32>;

    /// Returns a page-aligned range, previously obtained from a
    /// single `reserve` call, back to the OS.
    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;

    /// Makes `[base, base + size)` (a subset of a single `reserve`d
    /// range) readable and writable.  The memory backing a freshly
    /// committed range is zero-filled.
    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;
}

#[derive(Debug, Default)]
pub struct SystemMapper {}

fn errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}

impl Mapper for SystemMapper {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32> {
        assert!(size > 0 && (size % PAGE_SIZE) == 0, "bad reservation size");

        let ret = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ret == libc::MAP_FAILED {
            return Err(errno());
        }

        NonNull::new(ret).ok_or(libc::ENOMEM)
    }

    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        if size == 0 {
            return Ok(());
        }

        assert_eq!(size % PAGE_SIZE, 0, "bad release size");
        let ret = unsafe { libc::munmap(base.as_ptr(), size) };
        if ret == 0 {
            Ok(())
        } else {
            Err(errno())
        }
    }

    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        if size == 0 {
            return Ok(());
        }

        assert_eq!(size % PAGE_SIZE, 0, "bad commit size");
        let ret = unsafe {
            libc::mprotect(
                base.as_ptr(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };

        if ret == 0 {
            Ok(())
        } else {
            Err(errno())
        }
    }
}

/// Returns a reference to the shared default mapper.
pub fn get_default_mapper() -> &'static dyn Mapper {
    lazy_static::lazy_static! {
        static ref DEFAULT_MAPPER: SystemMapper = SystemMapper {};
    };

    &*DEFAULT_MAPPER
}

/// Returns the host page size, purely for the sanity check
/// `Dispatcher::new` runs before standing up any arena; every
/// allocator constant assumes [`PAGE_SIZE`] regardless of what the OS
/// reports.
pub fn host_page_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(ret > 0, "unable to determine host page size");
    ret as usize
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_page_size_matches_constant() {
        assert_eq!(host_page_size(), PAGE_SIZE);
    }

    #[test]
    fn reserve_commit_release_round_trips() {
        let mapper = SystemMapper {};
        let size = 4 * PAGE_SIZE;

        let base = mapper.reserve(size).expect("reserve should succeed");
        mapper.commit(base, size).expect("commit should succeed");

        unsafe {
            std::ptr::write_bytes(base.as_ptr() as *mut u8, 0x11, size);
            assert_eq!(*(base.as_ptr() as *const u8), 0x11);
        }

        mapper.release(base, size).expect("release should succeed");
    }
}
