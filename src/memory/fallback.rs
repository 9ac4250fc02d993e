//! Oversize fallback: requests above `MAX_POOL_UNIT` bypass the pools.

use crate::memory::framing::WORD;
use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;

/// General-purpose allocator behind the pool engine. Must be thread-safe.
pub trait FallbackAlloc: Send + Sync {
    /// Allocate `size` bytes aligned to at least one word, or `None`.
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` must come from [`alloc`](FallbackAlloc::alloc) on this allocator
    /// with the same `size`, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}

/// Forwards to the platform allocator with word-aligned layouts.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemFallback;

impl FallbackAlloc for SystemFallback {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, WORD).ok()?;
        // Safety: layout has non-zero size.
        NonNull::new(unsafe { System.alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        // Safety: `alloc` built the same layout from the same size.
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, WORD);
            System.dealloc(ptr.as_ptr(), layout);
        }
    }
}
