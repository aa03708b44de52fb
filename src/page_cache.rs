//! A small LIFO cache of recently released arena-sized reservations.
//!
//! The bulk allocator churns through whole arenas far less often than
//! it churns through chunks inside one, but a long-running service
//! that oscillates between heap-heavy and heap-light phases can still
//! bounce arenas in and out.  Caching a handful of freed reservations
//! avoids paying for `mmap`/`munmap` on every such transition.
//!
//! This plays the role Slitter's `MagazineStack` plays for empty
//! magazines, but as a plain LIFO `Vec` rather than an atomic
//! intrusive stack: the allocator this cache serves is single-threaded
//! per instance, so there is no concurrent access to guard against.
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::vm::Mapper;

/// Caches reservations of exactly one size; the bulk allocator and the
/// sounding-address page allocator each keep their own, since their
/// arenas are never interchangeable.
pub struct PageCache {
    block_size: usize,
    free_blocks: Vec<NonNull<c_void>>,
}

impl PageCache {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            free_blocks: Vec::new(),
        }
    }

    /// Returns a fresh, reserved-but-uncommitted block of `self.block_size`
    /// bytes, preferring a cached one over a new `mmap` call.
    pub fn get_free_block(&mut self, mapper: &dyn Mapper) -> Result<NonNull<c_void>, i32> {
        if let Some(cached) = self.free_blocks.pop() {
            return Ok(cached);
        }

        mapper.reserve(self.block_size)
    }

    /// Returns a block to the cache instead of releasing it to the OS.
    /// `addr` must have come from a prior `get_free_block` on this same
    /// cache, or from the matching `Mapper::reserve`.
    pub fn free_chunk(&mut self, addr: NonNull<c_void>) {
        self.free_blocks.push(addr);
    }

    /// Drains the cache, releasing every block back to the OS. Called
    /// only at `deinitialize`.
    pub fn drain(&mut self, mapper: &dyn Mapper) -> Result<(), i32> {
        while let Some(addr) = self.free_blocks.pop() {
            mapper.release(addr, self.block_size)?;
        }

        Ok(())
    }
}
