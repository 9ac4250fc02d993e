//! `GlobalAlloc` adapter over one process-wide [`HeaderedMultiplexer`].
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: segpool::GlobalSegmentAllocator = segpool::GlobalSegmentAllocator;
//!
//! fn main() {
//!     segpool::GlobalSegmentAllocator::init().unwrap();
//!     // ...
//! }
//! ```
//!
//! The pools serve word-aligned requests of 1 to [`MAX_POOL_UNIT`] bytes.
//! Everything else goes to [`System`]: wider alignment, larger sizes,
//! requests made before [`init`](GlobalSegmentAllocator::init), and the
//! allocator's own bookkeeping and log output while it holds its locks.
//! `dealloc` routes a pointer back to the pools only if their page source
//! owns it.

use crate::memory::framing::{MAX_POOL_UNIT, WORD};
use crate::memory::multiplexer::{BusyGuard, HeaderedMultiplexer, in_pool_code};
use crate::memory::provider::PageSource;
use crate::memory::stats::MultiplexerStats;
use crate::memory::vm::VmError;
use crate::sync::OnceLock;
use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;

static GLOBAL_INSTANCE: OnceLock<HeaderedMultiplexer> = OnceLock::new();

/// Zero-sized handle for `#[global_allocator]`.
pub struct GlobalSegmentAllocator;

impl GlobalSegmentAllocator {
    /// Build the process-wide multiplexer.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if the allocator is already
    /// initialized, or the multiplexer's own construction error.
    pub fn init() -> Result<(), VmError> {
        let _busy = BusyGuard::enter();
        GLOBAL_INSTANCE
            .set(HeaderedMultiplexer::new()?)
            .map_err(|_| VmError::InitializationFailed("Already initialized".to_string()))
    }

    pub fn is_initialized() -> bool {
        GLOBAL_INSTANCE.get().is_some()
    }

    /// See [`PoolMultiplexer::decommit_all`](crate::PoolMultiplexer::decommit_all).
    /// Returns 0 before [`init`](Self::init).
    pub fn decommit_all() -> usize {
        GLOBAL_INSTANCE.get().map_or(0, |mux| {
            let _busy = BusyGuard::enter();
            mux.decommit_all()
        })
    }

    /// See [`PoolMultiplexer::thread_detach`](crate::PoolMultiplexer::thread_detach).
    pub fn thread_detach() {
        if let Some(mux) = GLOBAL_INSTANCE.get() {
            let _busy = BusyGuard::enter();
            mux.thread_detach();
        }
    }

    /// `None` before [`init`](Self::init).
    pub fn stats() -> Option<MultiplexerStats> {
        GLOBAL_INSTANCE.get().map(|mux| {
            let _busy = BusyGuard::enter();
            mux.stats()
        })
    }

    #[inline]
    fn pooled(layout: &Layout) -> bool {
        layout.align() <= WORD && (1..=MAX_POOL_UNIT).contains(&layout.size())
    }
}

// Safety: every pointer is either a pool unit of at least `layout.size()`
// bytes, word aligned and `layout.align() <= WORD`, or comes straight from
// `System` with the caller's layout; `dealloc` sends each back to its source.
unsafe impl GlobalAlloc for GlobalSegmentAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if Self::pooled(&layout) && !in_pool_code() {
            if let Some(mux) = GLOBAL_INSTANCE.get() {
                let _busy = BusyGuard::enter();
                return mux
                    .allocate(layout.size())
                    .map_or(std::ptr::null_mut(), NonNull::as_ptr);
            }
        }
        // Safety: forwarded contract.
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Inside a BusyGuard only bookkeeping memory is freed, and all of it
        // came from System.
        if Self::pooled(&layout) && !in_pool_code() {
            if let (Some(mux), Some(unit)) = (GLOBAL_INSTANCE.get(), NonNull::new(ptr)) {
                let _busy = BusyGuard::enter();
                if mux.page_source().owns(unit) {
                    // Safety: the pools handed `ptr` out from `alloc`.
                    unsafe { mux.free(ptr) };
                    return;
                }
            }
        }
        // Safety: forwarded contract; `ptr` came from System.alloc.
        unsafe { System.dealloc(ptr, layout) }
    }
}
