//! Virtual Block Provider: page-granularity allocation on top of large
//! address-space reservations.
//!
//! Address space is reserved in regions of `region_size` bytes. Each region
//! tracks which of its pages are committed in a bitmap (bit set == in use).
//! A page is committed when handed out and decommitted when returned; a
//! region whose last page is returned is released to the OS.
//!
//! Every operation runs under one lock. Page turnover costs a syscall anyway,
//! so this lock is never the bottleneck; it is the only place in the crate
//! that may block on the OS while held.

use crate::memory::bookkeeping_corrupted;
use crate::memory::stats;
use crate::memory::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::{Mutex, lock};
use fixedbitset::FixedBitSet;
use log::{debug, trace, warn};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Default reservation granularity.
pub const REGION_SIZE: usize = 1 << 20;

/// Source of committed, page-aligned pages for the unit pools.
///
/// Implementations must be thread-safe; pools call into them while holding
/// their own locks.
pub trait PageSource: Send + Sync {
    /// Size of every page returned by [`allocate_page`](PageSource::allocate_page).
    fn page_size(&self) -> usize;

    /// Commit one page and return it. Failure is never retried here.
    fn allocate_page(&self) -> Result<NonNull<u8>, VmError>;

    /// Return a page obtained from [`allocate_page`](PageSource::allocate_page).
    ///
    /// # Safety
    /// `page` must have come from this source, must not have been freed
    /// already, and nothing may access it afterwards.
    unsafe fn free_page(&self, page: NonNull<u8>);

    /// Bytes currently committed through this source.
    fn allocated_byte_count(&self) -> usize;

    /// Whether `ptr` lies inside a page this source has handed out.
    fn owns(&self, ptr: NonNull<u8>) -> bool;
}

struct Region {
    base: NonNull<u8>,
    committed: FixedBitSet,
    free_pages: usize,
}

impl Region {
    /// # Safety
    /// `index` must be below the region's page count.
    unsafe fn page(&self, index: usize, page_size: usize) -> NonNull<u8> {
        // Safety: index < pages_per_region, so the offset stays inside the
        // reservation.
        unsafe { self.base.add(index * page_size) }
    }
}

struct ProviderState {
    // Keyed by base address; lookup by containment via `range(..=addr)`.
    regions: BTreeMap<usize, Region>,
    committed_pages: usize,
}

// Safety: region base pointers are only dereferenced by the pools the pages
// are handed to; the provider itself only passes them to the VM layer.
unsafe impl Send for ProviderState {}

pub struct VirtualBlockProvider<V: VmOps = PlatformVmOps> {
    state: Mutex<ProviderState>,
    page_size: usize,
    region_size: usize,
    pages_per_region: usize,
    _vm: PhantomData<fn() -> V>,
}

impl VirtualBlockProvider<PlatformVmOps> {
    pub fn new() -> Result<Self, VmError> {
        Self::with_region_size(REGION_SIZE)
    }
}

impl<V: VmOps> VirtualBlockProvider<V> {
    /// Create a provider reserving `region_size` bytes at a time.
    ///
    /// `region_size` must be a non-zero multiple of the OS page size.
    pub fn with_region_size(region_size: usize) -> Result<Self, VmError> {
        let page_size = V::page_size();
        if region_size == 0 || region_size % page_size != 0 {
            return Err(VmError::InitializationFailed(format!(
                "region size {region_size} is not a non-zero multiple of the page size {page_size}"
            )));
        }
        Ok(Self {
            state: Mutex::new(ProviderState {
                regions: BTreeMap::new(),
                committed_pages: 0,
            }),
            page_size,
            region_size,
            pages_per_region: region_size / page_size,
            _vm: PhantomData,
        })
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn region_count(&self) -> usize {
        lock(&self.state).regions.len()
    }

    fn reserve_region(&self, state: &mut ProviderState) -> Result<(), VmError> {
        // Safety: region_size is a non-zero multiple of the page size.
        let base = unsafe { V::reserve(self.region_size) }.inspect_err(|e| {
            warn!("reserving a {} byte region failed: {e}", self.region_size);
        })?;
        state.regions.insert(
            base.as_ptr().addr(),
            Region {
                base,
                committed: FixedBitSet::with_capacity(self.pages_per_region),
                free_pages: self.pages_per_region,
            },
        );
        stats::TOTAL_RESERVED.add(self.region_size);
        debug!(
            "reserved region {:p} ({} pages, {} regions live)",
            base,
            self.pages_per_region,
            state.regions.len()
        );
        Ok(())
    }

    fn release_region(&self, state: &mut ProviderState, key: usize) {
        let Some(region) = state.regions.remove(&key) else {
            return;
        };
        // Safety: base/region_size describe exactly the reservation made in
        // `reserve_region`, and no page of it is handed out any more.
        if let Err(e) = unsafe { V::release(region.base, self.region_size) } {
            warn!("releasing region {:p} failed: {e}", region.base);
        }
        stats::TOTAL_RESERVED.sub(self.region_size);
        debug!(
            "released region {:p} ({} regions live)",
            region.base,
            state.regions.len()
        );
    }

    /// Locate the region containing `addr`, if any.
    fn region_of(
        regions: &mut BTreeMap<usize, Region>,
        addr: usize,
        region_size: usize,
    ) -> Option<(usize, &mut Region)> {
        regions
            .range_mut(..=addr)
            .next_back()
            .filter(|(base, _)| addr < **base + region_size)
            .map(|(base, region)| (*base, region))
    }
}

impl<V: VmOps> PageSource for VirtualBlockProvider<V> {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate_page(&self) -> Result<NonNull<u8>, VmError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        if !state.regions.values().any(|r| r.free_pages > 0) {
            self.reserve_region(state)?;
        }
        let Some((&key, region)) = state.regions.iter_mut().find(|(_, r)| r.free_pages > 0)
        else {
            return Err(VmError::CommitFailed(std::io::Error::other(
                "no region with a free page after reservation",
            )));
        };
        let Some(index) = region.committed.zeroes().next() else {
            return Err(VmError::CommitFailed(std::io::Error::other(
                "region free page count disagrees with its bitmap",
            )));
        };

        // Safety: `zeroes` only yields indices below the bitmap length.
        let page = unsafe { region.page(index, self.page_size) };
        // Safety: the page lies inside a live reservation and is page aligned.
        if let Err(e) = unsafe { V::commit(page, self.page_size) } {
            warn!("committing page {page:p} failed: {e}");
            // A wholly free region can only be the one just reserved.
            if region.free_pages == self.pages_per_region {
                self.release_region(state, key);
            }
            return Err(e);
        }

        region.committed.insert(index);
        region.free_pages -= 1;
        state.committed_pages += 1;
        stats::TOTAL_COMMITTED.add(self.page_size);
        trace!("committed page {page:p}");
        Ok(page)
    }

    unsafe fn free_page(&self, page: NonNull<u8>) {
        let addr = page.as_ptr().addr();
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        let Some((key, region)) = Self::region_of(&mut state.regions, addr, self.region_size)
        else {
            bookkeeping_corrupted(format_args!(
                "free_page: {page:p} does not belong to any region"
            ));
        };
        let offset = addr - key;
        if offset % self.page_size != 0 {
            bookkeeping_corrupted(format_args!("free_page: {page:p} is not page aligned"));
        }
        let index = offset / self.page_size;
        if !region.committed.contains(index) {
            bookkeeping_corrupted(format_args!("free_page: page {page:p} is not committed"));
        }

        // Safety: the page is committed and the caller gave up all access.
        if let Err(e) = unsafe { V::decommit(page, self.page_size) } {
            // The page stays usable for a later commit; only the physical
            // memory is not returned.
            warn!("decommitting page {page:p} failed: {e}");
        }
        region.committed.set(index, false);
        region.free_pages += 1;
        let wholly_free = region.free_pages == self.pages_per_region;

        state.committed_pages -= 1;
        stats::TOTAL_COMMITTED.sub(self.page_size);
        trace!("decommitted page {page:p}");

        if wholly_free {
            self.release_region(state, key);
        }
    }

    fn allocated_byte_count(&self) -> usize {
        lock(&self.state).committed_pages * self.page_size
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr().addr();
        let mut state = lock(&self.state);
        Self::region_of(&mut state.regions, addr, self.region_size).is_some_and(|(base, region)| {
            region.committed.contains((addr - base) / self.page_size)
        })
    }
}

impl<V: VmOps> Drop for VirtualBlockProvider<V> {
    fn drop(&mut self) {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.regions.is_empty() {
            return;
        }
        warn!(
            "provider dropped with {} regions and {} committed pages outstanding",
            state.regions.len(),
            state.committed_pages
        );
        stats::TOTAL_COMMITTED.sub(state.committed_pages * self.page_size);
        state.committed_pages = 0;
        let keys: Vec<usize> = state.regions.keys().copied().collect();
        for key in keys {
            self.release_region(state, key);
        }
    }
}
