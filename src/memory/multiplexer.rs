//! Pool Multiplexer: the allocator's public face.
//!
//! Every thread that touches a multiplexer gets its own pool set (one
//! [`FixedUnitPool`] per size class), created on first use and recorded in a
//! registry so decommit and teardown can reach it. Each size class also has
//! one shared [`CachePool`] that buffers units between threads.
//!
//! Lock order: registry -> thread pool (class) -> cache pool (class) ->
//! page source. A thread's own pool locks are uncontended except against
//! decommit, stats and teardown.

use crate::memory::cache_pool::CachePool;
use crate::memory::config::PoolConfig;
use crate::memory::fallback::{FallbackAlloc, SystemFallback};
use crate::memory::framing::{
    FramingPolicy, MAX_POOL_UNIT, NoHeader, POOL_CLASS_COUNT, WithHeader, class_capacity,
    class_of,
};
use crate::memory::provider::{PageSource, VirtualBlockProvider};
use crate::memory::stats::{ClassStats, MultiplexerStats};
use crate::memory::unit_pool::{FixedUnitPool, POISON, PageCounts, UnitGeometry};
use crate::memory::vm::VmError;
use crate::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crate::sync::{Arc, Mutex, MutexGuard, lock};
use log::{debug, trace, warn};
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::ptr::NonNull;

crate::sync::static_atomic! {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
}

/// Where a handed-out pointer came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    Pool,
    Fallback,
}

/// One thread's pools, one per size class.
struct PoolSet {
    owner: u64,
    pools: Box<[Mutex<FixedUnitPool>]>,
    caches: Arc<Vec<CachePool>>,
    /// Set while a thread is bound; an unbound set may be claimed by the
    /// next thread that needs one.
    attached: AtomicBool,
    /// Set when the multiplexer is dropped; stale bindings are pruned.
    retired: AtomicBool,
}

impl PoolSet {
    fn new(owner: u64, geometries: &[UnitGeometry], caches: Arc<Vec<CachePool>>) -> Self {
        Self {
            owner,
            pools: geometries
                .iter()
                .map(|&g| Mutex::new(FixedUnitPool::new(g)))
                .collect(),
            caches,
            attached: AtomicBool::new(true),
            retired: AtomicBool::new(false),
        }
    }

    /// Move every free unit into the caches. Returns the number moved.
    fn flush(&self) -> usize {
        if self.retired.load(Ordering::Acquire) {
            return 0;
        }
        self.pools
            .iter()
            .zip(self.caches.iter())
            .map(|(pool, cache)| cache.absorb(&mut lock(pool), usize::MAX))
            .sum()
    }
}

/// A thread's claim on a pool set. Dropped on detach or thread exit, which
/// flushes the set into the caches and leaves it free for reuse.
struct Binding {
    set: Arc<PoolSet>,
}

impl Drop for Binding {
    fn drop(&mut self) {
        let _busy = BusyGuard::enter();
        let flushed = self.set.flush();
        self.set.attached.store(false, Ordering::Release);
        debug!(
            "pool multiplexer #{}: thread unbound, {flushed} free units moved to the caches",
            self.set.owner
        );
    }
}

thread_local! {
    // Usually one entry; one per multiplexer this thread has touched.
    static BINDINGS: RefCell<Vec<Binding>> = const { RefCell::new(Vec::new()) };

    static IN_POOL_CODE: Cell<bool> = const { Cell::new(false) };
}

/// Marks the calling thread as running allocator code until dropped.
/// Nests; the previous state is restored on drop.
pub(crate) struct BusyGuard {
    was_busy: bool,
}

impl BusyGuard {
    pub(crate) fn enter() -> Self {
        let was_busy = IN_POOL_CODE.try_with(|busy| busy.replace(true)).unwrap_or(false);
        Self { was_busy }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let _ = IN_POOL_CODE.try_with(|busy| busy.set(self.was_busy));
    }
}

/// Whether the calling thread is inside a [`BusyGuard`]. Allocations made
/// from there (bookkeeping, logging) must not re-enter the pools.
#[cfg_attr(loom, allow(dead_code))]
pub(crate) fn in_pool_code() -> bool {
    IN_POOL_CODE.try_with(Cell::get).unwrap_or(false)
}

/// Size-classed allocator over per-thread unit pools.
///
/// `F` picks the unit framing ([`WithHeader`] or [`NoHeader`]), `P` the page
/// source and `B` the allocator used for requests above [`MAX_POOL_UNIT`].
pub struct PoolMultiplexer<
    F: FramingPolicy,
    P: PageSource = VirtualBlockProvider,
    B: FallbackAlloc = SystemFallback,
> {
    id: u64,
    config: PoolConfig,
    pages: P,
    fallback: B,
    geometries: Box<[UnitGeometry]>,
    caches: Arc<Vec<CachePool>>,
    registry: Mutex<Vec<Arc<PoolSet>>>,
    _framing: PhantomData<fn() -> F>,
}

/// Units carry their size; free with [`PoolMultiplexer::free`].
pub type HeaderedMultiplexer = PoolMultiplexer<WithHeader>;

/// Bare units; free with [`PoolMultiplexer::free_with_size`].
pub type HeaderlessMultiplexer = PoolMultiplexer<NoHeader>;

impl<F: FramingPolicy> PoolMultiplexer<F> {
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if the page size cannot hold
    /// a unit of every class.
    pub fn new() -> Result<Self, VmError> {
        Self::with_config(PoolConfig::default())
    }

    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` for an invalid `config`.
    pub fn with_config(config: PoolConfig) -> Result<Self, VmError> {
        config.validate()?;
        let pages = VirtualBlockProvider::with_region_size(config.region_size)?;
        Self::with_parts(config, pages, SystemFallback)
    }
}

impl<F: FramingPolicy, P: PageSource, B: FallbackAlloc> PoolMultiplexer<F, P, B> {
    /// Build a multiplexer over an explicit page source and fallback.
    /// `config.region_size` is not used; the page source owns its layout.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` for an invalid `config` or a
    /// page size too small for the largest class.
    pub fn with_parts(config: PoolConfig, pages: P, fallback: B) -> Result<Self, VmError> {
        config.validate()?;
        let page_size = pages.page_size();
        let geometries = (0..POOL_CLASS_COUNT)
            .map(|class| UnitGeometry::new(F::unit_size(class), page_size))
            .collect::<Result<Box<[_]>, _>>()?;
        let caches = Arc::new(geometries.iter().map(|&g| CachePool::new(g)).collect());
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "pool multiplexer #{id}: {POOL_CLASS_COUNT} classes up to {MAX_POOL_UNIT} bytes, \
             header {} bytes, page {page_size} bytes",
            F::HEADER_BYTES
        );
        Ok(Self {
            id,
            config,
            pages,
            fallback,
            geometries,
            caches,
            registry: Mutex::new(Vec::new()),
            _framing: PhantomData,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn page_source(&self) -> &P {
        &self.pages
    }

    /// Bytes currently committed by the page source.
    pub fn allocated_byte_count(&self) -> usize {
        self.pages.allocated_byte_count()
    }

    /// Allocate `size` bytes, word aligned. `None` for a zero size or when
    /// memory is exhausted.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        match self.try_allocate(size) {
            Ok(ptr) => Some(ptr),
            Err(e) => {
                warn!("allocate({size}) failed: {e}");
                None
            }
        }
    }

    /// [`allocate`](Self::allocate) with the failure reason.
    ///
    /// # Errors
    ///
    /// `VmError::InvalidSize` for zero, `VmError::FallbackFailed` when the
    /// oversize allocator refuses, or the page source's error.
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::InvalidSize(size));
        }
        let Some(class) = class_of(size) else {
            return self.allocate_oversize(size);
        };

        let unit = match self.bound_set() {
            Some(set) => self.allocate_from(&set, class)?,
            None => self.caches[class].allocate_unit(&self.pages)?,
        };
        if cfg!(debug_assertions) {
            // Safety: the unit was just handed to us and spans unit_size bytes.
            unsafe { std::ptr::write_bytes(unit.as_ptr(), POISON, self.geometries[class].unit_size) };
        }
        // Safety: unit_size = HEADER_BYTES + class capacity >= HEADER_BYTES + size.
        Ok(unsafe { F::frame_pool_unit(unit, size) })
    }

    fn allocate_oversize(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        let total = size
            .checked_add(F::HEADER_BYTES)
            .ok_or(VmError::FallbackFailed { size })?;
        let block = self
            .fallback
            .alloc(total)
            .ok_or(VmError::FallbackFailed { size })?;
        // Safety: the block spans size + HEADER_BYTES bytes.
        Ok(unsafe { F::frame_proxy_unit(block, size) })
    }

    fn allocate_from(&self, set: &PoolSet, class: usize) -> Result<NonNull<u8>, VmError> {
        let mut pool = lock(&set.pools[class]);
        if pool.is_empty() {
            let cache = &self.caches[class];
            let per_page = cache.geometry().units_per_page;
            // Unlocked read; losing a race just means faulting in a page.
            if cache.free_hint() > per_page * self.config.cache_low_water_pages {
                cache.refill(&mut pool, per_page * self.config.cache_refill_pages);
            }
        }
        pool.allocate_unit(&self.pages)
    }

    /// # Safety
    /// `unit` must be a live unit of `class` handed out by this multiplexer.
    unsafe fn free_into(&self, set: &PoolSet, class: usize, unit: NonNull<u8>) {
        let mut pool = lock(&set.pools[class]);
        // Safety: forwarded contract.
        unsafe { pool.free_unit(unit) };
        let per_page = self.geometries[class].units_per_page;
        if pool.free_units() >= per_page * self.config.thread_high_water_pages {
            self.caches[class].absorb(&mut pool, per_page * self.config.thread_spill_pages);
        }
    }

    /// Free a pointer of `size` requested bytes.
    ///
    /// # Safety
    /// `ptr` must be live, handed out by this multiplexer for `size` bytes.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        // Safety: forwarded contract.
        let block = unsafe { F::unframe(ptr) };
        let Some(class) = class_of(size) else {
            assert!(size != 0, "free of zero-size allocation {ptr:p}");
            // Safety: oversize blocks came from the fallback with this total.
            unsafe { self.fallback.free(block, size + F::HEADER_BYTES) };
            return;
        };

        if cfg!(debug_assertions) {
            assert!(
                self.pages.owns(block),
                "{ptr:p} was not allocated by this pool multiplexer"
            );
            Self::check_slack(ptr, size, class);
        }

        match self.bound_set() {
            // Safety: forwarded contract.
            Some(set) => unsafe { self.free_into(&set, class, block) },
            // Safety: forwarded contract.
            None => unsafe { self.caches[class].free_unit(block) },
        }
    }

    /// Debug check: bytes between the requested size and the class capacity
    /// must still hold the allocation-time poison.
    fn check_slack(ptr: NonNull<u8>, size: usize, class: usize) {
        let capacity = class_capacity(class);
        // Safety: the unit spans `capacity` bytes from `ptr`.
        let slack = unsafe { std::slice::from_raw_parts(ptr.as_ptr().add(size), capacity - size) };
        assert!(
            slack.iter().all(|&b| b == POISON),
            "write past the {size} byte bound of {ptr:p}"
        );
    }

    /// Report whether `ptr` came from a pool or from the fallback.
    /// Diagnostic only.
    ///
    /// # Safety
    /// `ptr` must be live and handed out by this multiplexer.
    pub unsafe fn owner_of(&self, ptr: NonNull<u8>) -> Owner {
        // Safety: forwarded contract.
        match unsafe { F::read_size(ptr) } {
            Some(size) if size > MAX_POOL_UNIT => Owner::Fallback,
            Some(_) => Owner::Pool,
            None if self.pages.owns(ptr) => Owner::Pool,
            None => Owner::Fallback,
        }
    }

    /// Return every wholly free page of every class to the page source.
    /// Returns the number of pages released.
    pub fn decommit_all(&self) -> usize {
        let registry = lock(&self.registry);
        let released: usize = (0..POOL_CLASS_COUNT)
            .map(|class| self.decommit_locked(&registry, class))
            .sum();
        debug!(
            "pool multiplexer #{}: decommit released {released} pages across {} pool sets",
            self.id,
            registry.len()
        );
        released
    }

    /// Decommit only the class serving `size`. Returns the pages released.
    pub fn decommit_class(&self, size: usize) -> usize {
        let Some(class) = class_of(size) else {
            warn!("decommit_class({size}): no pool class serves this size");
            return 0;
        };
        let registry = lock(&self.registry);
        let released = self.decommit_locked(&registry, class);
        debug!(
            "pool multiplexer #{}: decommit of class {class} released {released} pages",
            self.id
        );
        released
    }

    /// Run the three decommit phases over every pool of `class`, holding all
    /// of them (and the cache) for the duration.
    fn decommit_locked(&self, sets: &[Arc<PoolSet>], class: usize) -> usize {
        let mut pools: Vec<MutexGuard<'_, FixedUnitPool>> =
            sets.iter().map(|set| lock(&set.pools[class])).collect();
        let cache = &self.caches[class];
        let mut cached = cache.lock();

        let mut counts = PageCounts::new();
        for pool in &pools {
            pool.pre_decommit(&mut counts);
        }
        cached.pre_decommit(&mut counts);

        for pool in &mut pools {
            pool.reclaim_selection(&counts);
        }
        cached.reclaim_selection(&counts);

        // Safety: phase 2 ran on every pool of the class under the locks
        // still held here.
        let mut released: usize = pools
            .iter_mut()
            .map(|pool| unsafe { pool.finalize_decommit(&counts, &self.pages) })
            .sum();
        // Safety: as above.
        released += unsafe { cached.finalize_decommit(&counts, &self.pages) };
        cache.publish(&cached);

        trace!(
            "class {class}: {} pages scanned, {released} released",
            counts.len()
        );
        released
    }

    /// Bind the calling thread to a pool set now instead of on first use.
    /// Returns `false` if thread-local storage is unavailable.
    pub fn thread_attach(&self) -> bool {
        self.bound_set().is_some()
    }

    /// Unbind the calling thread and move its free units into the caches.
    /// The pool set stays registered: its pages may still back live units,
    /// decommit reclaims them once they empty, and the next thread without
    /// a set adopts it.
    pub fn thread_detach(&self) {
        let binding = BINDINGS
            .try_with(|bindings| {
                let mut bindings = bindings.borrow_mut();
                let index = bindings.iter().position(|b| b.set.owner == self.id)?;
                Some(bindings.swap_remove(index))
            })
            .ok()
            .flatten();
        // Flushes outside the RefCell borrow.
        drop(binding);
    }

    /// The calling thread's pool set, claimed on first use.
    fn bound_set(&self) -> Option<Arc<PoolSet>> {
        BINDINGS
            .try_with(|bindings| {
                if let Some(b) = bindings.borrow().iter().find(|b| b.set.owner == self.id) {
                    return Arc::clone(&b.set);
                }
                let set = self.claim_set();
                let stale: Vec<Binding> = {
                    let mut bindings = bindings.borrow_mut();
                    let (stale, live) = std::mem::take(&mut *bindings)
                        .into_iter()
                        .partition(|b| b.set.retired.load(Ordering::Acquire));
                    *bindings = live;
                    bindings.push(Binding {
                        set: Arc::clone(&set),
                    });
                    stale
                };
                drop(stale);
                set
            })
            .ok()
    }

    /// Adopt an unbound pool set left by a detached or exited thread, or
    /// register a new one.
    fn claim_set(&self) -> Arc<PoolSet> {
        let mut registry = lock(&self.registry);
        let unbound = registry.iter().find(|set| {
            set.attached
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        });
        if let Some(set) = unbound {
            trace!("pool multiplexer #{}: unbound pool set adopted", self.id);
            return Arc::clone(set);
        }
        let set = Arc::new(PoolSet::new(
            self.id,
            &self.geometries,
            Arc::clone(&self.caches),
        ));
        registry.push(Arc::clone(&set));
        debug!(
            "pool multiplexer #{}: pool set registered ({} total)",
            self.id,
            registry.len()
        );
        set
    }

    /// Snapshot of per-class usage across every pool set and cache.
    pub fn stats(&self) -> MultiplexerStats {
        let registry = lock(&self.registry);
        let classes = (0..POOL_CLASS_COUNT)
            .map(|class| {
                let g = &self.geometries[class];
                let mut stats = ClassStats {
                    unit_size: g.unit_size,
                    units_per_page: g.units_per_page,
                    ..ClassStats::default()
                };
                for set in registry.iter() {
                    add_pool(&mut stats, &lock(&set.pools[class]));
                }
                let cached = self.caches[class].lock();
                add_pool(&mut stats, &cached);
                stats.cache_free_units = cached.free_units();
                stats
            })
            .collect();
        MultiplexerStats {
            committed_bytes: self.pages.allocated_byte_count(),
            pool_sets: registry.len(),
            attached_pool_sets: registry
                .iter()
                .filter(|set| set.attached.load(Ordering::Relaxed))
                .count(),
            classes,
        }
    }
}

fn add_pool(stats: &mut ClassStats, pool: &FixedUnitPool) {
    let counters = pool.counters();
    stats.page_count += pool.page_count();
    stats.free_units += pool.free_units();
    stats.allocated += counters.allocated;
    stats.freed += counters.freed;
    stats.peak_live_units += counters.peak_live;
}

impl<P: PageSource, B: FallbackAlloc> PoolMultiplexer<WithHeader, P, B> {
    /// Free a pointer from [`allocate`](Self::allocate). Null is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or live and handed out by this multiplexer.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        // Safety: forwarded contract.
        unsafe {
            let size = WithHeader::recorded_size(ptr);
            self.release(ptr, size);
        }
    }
}

impl<P: PageSource, B: FallbackAlloc> PoolMultiplexer<NoHeader, P, B> {
    /// Free a pointer from [`allocate`](Self::allocate) given its original
    /// size. Null is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or live and handed out by this multiplexer for
    /// exactly `size` bytes.
    pub unsafe fn free_with_size(&self, ptr: *mut u8, size: usize) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        // Safety: forwarded contract.
        unsafe { self.release(ptr, size) }
    }
}

impl<F: FramingPolicy, P: PageSource, B: FallbackAlloc> Drop for PoolMultiplexer<F, P, B> {
    fn drop(&mut self) {
        let id = self.id;
        let sets = std::mem::take(&mut *lock(&self.registry));
        for set in &sets {
            set.retired.store(true, Ordering::Release);
        }
        let ours = BINDINGS
            .try_with(|bindings| {
                let mut bindings = bindings.borrow_mut();
                let (ours, rest) = std::mem::take(&mut *bindings)
                    .into_iter()
                    .partition::<Vec<_>, _>(|b| b.set.owner == id);
                *bindings = rest;
                ours
            })
            .unwrap_or_default();
        drop(ours);

        let mut released = 0;
        for set in &sets {
            for pool in set.pools.iter() {
                // Safety: the multiplexer is going away; no unit of it may be
                // used after this point.
                released += unsafe { lock(pool).release_all_pages(&self.pages) };
            }
        }
        for cache in self.caches.iter() {
            // Safety: as above.
            released += unsafe { cache.lock().release_all_pages(&self.pages) };
        }
        debug!(
            "pool multiplexer #{id}: dropped, {released} pages from {} pool sets returned",
            sets.len()
        );
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::framing::WORD;
    use crate::memory::vm::{PlatformVmOps, VmOps};
    use proptest::prelude::*;

    fn units_per_page(unit_size: usize) -> usize {
        PlatformVmOps::page_size() / unit_size
    }

    #[test]
    fn test_zero_size_is_rejected() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderedMultiplexer::new().unwrap();
        assert!(mux.allocate(0).is_none());
        assert!(matches!(mux.try_allocate(0), Err(VmError::InvalidSize(0))));
        assert_eq!(mux.allocated_byte_count(), 0);
    }

    #[test]
    fn test_null_free_is_noop() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let headered = HeaderedMultiplexer::new().unwrap();
        let headerless = HeaderlessMultiplexer::new().unwrap();
        // Safety: Test code.
        unsafe {
            headered.free(std::ptr::null_mut());
            headerless.free_with_size(std::ptr::null_mut(), 32);
        }
    }

    #[test]
    fn test_every_pool_size_is_writable_and_aligned() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderedMultiplexer::new().unwrap();
        let ptrs: Vec<_> = (1..=MAX_POOL_UNIT)
            .map(|size| {
                let p = mux.allocate(size).unwrap();
                assert_eq!(p.as_ptr().addr() % WORD, 0);
                // Safety: Test code.
                unsafe { std::ptr::write_bytes(p.as_ptr(), size as u8, size) };
                (p, size)
            })
            .collect();
        for &(p, size) in &ptrs {
            // Safety: Test code.
            let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == size as u8));
            // Safety: Test code.
            assert_eq!(unsafe { mux.owner_of(p) }, Owner::Pool);
        }
        for (p, _) in ptrs {
            // Safety: Test code.
            unsafe { mux.free(p.as_ptr()) };
        }
        assert_eq!(mux.stats().live_units(), 0);
    }

    #[test]
    fn test_oversize_goes_to_fallback() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderedMultiplexer::new().unwrap();
        let p = mux.allocate(MAX_POOL_UNIT + 1).unwrap();
        let q = mux.allocate(MAX_POOL_UNIT).unwrap();
        // Safety: Test code.
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0x77, MAX_POOL_UNIT + 1);
            assert_eq!(mux.owner_of(p), Owner::Fallback);
            assert_eq!(mux.owner_of(q), Owner::Pool);
            mux.free(p.as_ptr());
            mux.free(q.as_ptr());
        }
        // Only the pool unit committed a page.
        assert_eq!(mux.allocated_byte_count(), PlatformVmOps::page_size());
    }

    #[test]
    fn test_headerless_owner_uses_page_source() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderlessMultiplexer::new().unwrap();
        let small = mux.allocate(24).unwrap();
        let big = mux.allocate(4000).unwrap();
        // Safety: Test code.
        unsafe {
            assert_eq!(mux.owner_of(small), Owner::Pool);
            assert_eq!(mux.owner_of(big), Owner::Fallback);
            mux.free_with_size(small.as_ptr(), 24);
            mux.free_with_size(big.as_ptr(), 4000);
        }
    }

    #[test]
    fn test_reuse_does_not_grow() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderlessMultiplexer::new().unwrap();
        let a = mux.allocate(40).unwrap();
        let committed = mux.allocated_byte_count();
        // Safety: Test code.
        unsafe { mux.free_with_size(a.as_ptr(), 40) };
        // Same class, different size.
        let b = mux.allocate(33).unwrap();
        assert_eq!(a, b);
        assert_eq!(mux.allocated_byte_count(), committed);
        // Safety: Test code.
        unsafe { mux.free_with_size(b.as_ptr(), 33) };
    }

    #[test]
    fn test_one_page_of_units_then_one_more_faults_once() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderlessMultiplexer::new().unwrap();
        let page = PlatformVmOps::page_size();
        let n = units_per_page(32);

        let mut ptrs: Vec<_> = (0..n).map(|_| mux.allocate(32).unwrap()).collect();
        assert_eq!(mux.allocated_byte_count(), page);
        ptrs.push(mux.allocate(32).unwrap());
        assert_eq!(mux.allocated_byte_count(), 2 * page);

        for p in ptrs {
            // Safety: Test code.
            unsafe { mux.free_with_size(p.as_ptr(), 32) };
        }
    }

    #[test]
    fn test_header_reserves_a_word() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderedMultiplexer::new().unwrap();
        let n = units_per_page(32 + WORD);
        let ptrs: Vec<_> = (0..n).map(|_| mux.allocate(32).unwrap()).collect();
        assert_eq!(mux.allocated_byte_count(), PlatformVmOps::page_size());
        for pair in ptrs.windows(2) {
            assert_eq!(pair[1].as_ptr().addr() - pair[0].as_ptr().addr(), 32 + WORD);
        }
        for p in ptrs {
            // Safety: Test code.
            unsafe { mux.free(p.as_ptr()) };
        }
    }

    #[test]
    fn test_decommit_class_rejects_unpooled_sizes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderlessMultiplexer::new().unwrap();
        assert_eq!(mux.decommit_class(0), 0);
        assert_eq!(mux.decommit_class(MAX_POOL_UNIT + 1), 0);
    }

    #[test]
    fn test_attach_detach_moves_free_units_to_cache() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderlessMultiplexer::new().unwrap();
        assert!(mux.thread_attach());
        let stats = mux.stats();
        assert_eq!((stats.pool_sets, stats.attached_pool_sets), (1, 1));

        let p = mux.allocate(16).unwrap();
        // Safety: Test code.
        unsafe { mux.free_with_size(p.as_ptr(), 16) };
        let n = units_per_page(16);

        mux.thread_detach();
        let stats = mux.stats();
        assert_eq!((stats.pool_sets, stats.attached_pool_sets), (1, 0));
        let class = &stats.classes[class_of(16).unwrap()];
        assert_eq!(class.cache_free_units, n);
        assert_eq!(class.free_units, n);

        // Detaching twice is harmless; the next allocation re-attaches to
        // the same, now unbound, set.
        mux.thread_detach();
        let q = mux.allocate(16).unwrap();
        let stats = mux.stats();
        assert_eq!((stats.pool_sets, stats.attached_pool_sets), (1, 1));
        // Safety: Test code.
        unsafe { mux.free_with_size(q.as_ptr(), 16) };
    }

    #[test]
    fn test_detach_attach_cycles_reuse_one_set() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderedMultiplexer::new().unwrap();
        for _ in 0..10 {
            let p = mux.allocate(48).unwrap();
            // Safety: Test code.
            unsafe { mux.free(p.as_ptr()) };
            mux.thread_detach();
        }
        let stats = mux.stats();
        assert_eq!((stats.pool_sets, stats.attached_pool_sets), (1, 0));
        assert_eq!(stats.committed_bytes, PlatformVmOps::page_size());
    }

    #[test]
    fn test_drop_returns_every_page() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let provider = Arc::new(VirtualBlockProvider::new().unwrap());
        let mux = PoolMultiplexer::<NoHeader, _, _>::with_parts(
            PoolConfig::default(),
            SharedPages(Arc::clone(&provider)),
            SystemFallback,
        )
        .unwrap();
        for size in [8, 64, 128] {
            // Live units at drop time are reclaimed too.
            let _ = mux.allocate(size).unwrap();
        }
        assert_eq!(provider.allocated_byte_count(), 3 * PlatformVmOps::page_size());
        drop(mux);
        assert_eq!(provider.allocated_byte_count(), 0);
        assert_eq!(provider.region_count(), 0);
    }

    #[test]
    fn test_stats_track_allocations() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderedMultiplexer::new().unwrap();
        let ptrs: Vec<_> = (0..10).map(|_| mux.allocate(100).unwrap()).collect();
        let stats = mux.stats();
        let class = &stats.classes[class_of(100).unwrap()];
        assert_eq!(class.allocated, 10);
        assert_eq!(class.live_units(), 10);
        assert_eq!(class.peak_live_units, 10);
        assert_eq!(class.page_count, 1);
        assert_eq!(class.unit_size, 104 + WORD);
        assert_eq!(stats.committed_bytes, PlatformVmOps::page_size());
        for p in ptrs {
            // Safety: Test code.
            unsafe { mux.free(p.as_ptr()) };
        }
        let stats = mux.stats();
        assert_eq!(stats.live_units(), 0);
        assert_eq!(stats.classes[class_of(100).unwrap()].peak_live_units, 10);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "write past")]
    fn test_overrun_detected_on_free() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderedMultiplexer::new().unwrap();
        let p = mux.allocate(10).unwrap();
        // Safety: Test code; the 11th byte is the bug under test.
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0, 11);
            mux.free(p.as_ptr());
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_misuse_panic_leaves_pools_usable() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderlessMultiplexer::new().unwrap();
        let a = mux.allocate(32).unwrap();
        // Safety: Test code.
        unsafe { mux.free_with_size(a.as_ptr(), 32) };
        let second_free = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            // Safety: Test code; the double free is the bug under test.
            unsafe { mux.free_with_size(a.as_ptr(), 32) }
        }));
        assert!(second_free.is_err());

        // The check fired before the list changed, so the pool still works.
        assert_eq!(mux.allocate(32).unwrap(), a);
        let stats = mux.stats();
        assert_eq!(stats.live_units(), 1);
        assert_eq!(stats.classes[class_of(32).unwrap()].free_units, units_per_page(32) - 1);
        // Safety: Test code.
        unsafe { mux.free_with_size(a.as_ptr(), 32) };
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "not allocated by this pool multiplexer")]
    fn test_foreign_pointer_detected_on_free() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = HeaderlessMultiplexer::new().unwrap();
        let other = HeaderlessMultiplexer::new().unwrap();
        let p = other.allocate(16).unwrap();
        // Safety: Test code; freeing into the wrong multiplexer is the bug.
        unsafe { mux.free_with_size(p.as_ptr(), 16) };
    }

    #[cfg(not(miri))]
    #[test]
    fn test_corrupted_free_list_halts_decommit() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        crate::memory::assert_aborts(
            "memory::multiplexer::tests::test_corrupted_free_list_halts_decommit",
            || {
                let mux = HeaderlessMultiplexer::new().unwrap();
                let [a, b, c] = [(); 3].map(|_| mux.allocate(32).unwrap());
                // Safety: Test code; after freeing b, a, c the list runs
                // c -> a -> b, and a's link word names b. Copying it into b
                // makes b point at itself.
                unsafe {
                    mux.free_with_size(b.as_ptr(), 32);
                    mux.free_with_size(a.as_ptr(), 32);
                    mux.free_with_size(c.as_ptr(), 32);
                    let link_to_b = a.as_ptr().cast::<usize>().read();
                    b.as_ptr().cast::<usize>().write(link_to_b);
                }
                mux.decommit_class(32);
            },
        );
    }

    #[test]
    fn test_fallback_failure_is_reported() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mux = PoolMultiplexer::<WithHeader, _, _>::with_parts(
            PoolConfig::default(),
            VirtualBlockProvider::new().unwrap(),
            Refusing,
        )
        .unwrap();
        assert!(matches!(
            mux.try_allocate(4096),
            Err(VmError::FallbackFailed { size: 4096 })
        ));
        assert!(mux.allocate(4096).is_none());
        assert!(mux.allocate(64).is_some());
    }

    #[test]
    fn test_page_exhaustion_returns_none_until_pages_return() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pages = FlakyPages {
            inner: VirtualBlockProvider::new().unwrap(),
            refuse: AtomicBool::new(true),
        };
        let mux =
            PoolMultiplexer::<WithHeader, _, _>::with_parts(PoolConfig::default(), pages, SystemFallback)
                .unwrap();

        assert!(mux.allocate(32).is_none());
        assert!(matches!(mux.try_allocate(32), Err(VmError::CommitFailed(_))));
        assert_eq!(mux.allocated_byte_count(), 0);
        // Oversize requests never touch the page source.
        let big = mux.allocate(MAX_POOL_UNIT + 1).unwrap();

        mux.page_source().refuse.store(false, Ordering::Relaxed);
        let p = mux.allocate(32).unwrap();
        assert_eq!(mux.allocated_byte_count(), PlatformVmOps::page_size());
        // Safety: Test code.
        unsafe {
            mux.free(p.as_ptr());
            mux.free(big.as_ptr());
        }
        assert_eq!(mux.stats().live_units(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = PoolConfig {
            thread_spill_pages: 0,
            ..PoolConfig::default()
        };
        assert!(HeaderlessMultiplexer::with_config(cfg).is_err());
    }

    struct SharedPages(Arc<VirtualBlockProvider>);

    impl PageSource for SharedPages {
        fn page_size(&self) -> usize {
            self.0.page_size()
        }
        fn allocate_page(&self) -> Result<NonNull<u8>, VmError> {
            self.0.allocate_page()
        }
        unsafe fn free_page(&self, page: NonNull<u8>) {
            // Safety: forwarded contract.
            unsafe { self.0.free_page(page) }
        }
        fn allocated_byte_count(&self) -> usize {
            self.0.allocated_byte_count()
        }
        fn owns(&self, ptr: NonNull<u8>) -> bool {
            self.0.owns(ptr)
        }
    }

    /// Refuses every commit while `refuse` is set.
    struct FlakyPages {
        inner: VirtualBlockProvider,
        refuse: AtomicBool,
    }

    impl PageSource for FlakyPages {
        fn page_size(&self) -> usize {
            self.inner.page_size()
        }
        fn allocate_page(&self) -> Result<NonNull<u8>, VmError> {
            if self.refuse.load(Ordering::Relaxed) {
                return Err(VmError::CommitFailed(std::io::Error::other("out of pages")));
            }
            self.inner.allocate_page()
        }
        unsafe fn free_page(&self, page: NonNull<u8>) {
            // Safety: forwarded contract.
            unsafe { self.inner.free_page(page) }
        }
        fn allocated_byte_count(&self) -> usize {
            self.inner.allocated_byte_count()
        }
        fn owns(&self, ptr: NonNull<u8>) -> bool {
            self.inner.owns(ptr)
        }
    }

    struct Refusing;

    impl FallbackAlloc for Refusing {
        fn alloc(&self, _size: usize) -> Option<NonNull<u8>> {
            None
        }
        unsafe fn free(&self, _ptr: NonNull<u8>, _size: usize) {
            unreachable!("nothing was allocated")
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_alloc_free_any_order_restores_free_count(
            size in 1usize..=MAX_POOL_UNIT,
            count in 1usize..300,
            seed in any::<u64>(),
        ) {
            let _guard = crate::memory::TEST_MUTEX.read().unwrap();
            let mux = HeaderlessMultiplexer::new().unwrap();
            let class = class_of(size).unwrap();

            // Warm up so the class owns at least one page.
            let warm = mux.allocate(size).unwrap();
            // Safety: Test code.
            unsafe { mux.free_with_size(warm.as_ptr(), size) };
            let free_before = mux.stats().classes[class].free_units;
            let committed_before = mux.allocated_byte_count();

            let mut ptrs: Vec<_> = (0..count).map(|_| mux.allocate(size).unwrap()).collect();
            let committed_peak = mux.allocated_byte_count();

            // Deterministic shuffle.
            let mut state = seed | 1;
            for i in (1..ptrs.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                ptrs.swap(i, (state % (i as u64 + 1)) as usize);
            }
            for p in ptrs {
                // Safety: Test code.
                unsafe { mux.free_with_size(p.as_ptr(), size) };
            }

            let stats = mux.stats();
            prop_assert_eq!(mux.allocated_byte_count(), committed_peak);
            prop_assert!(committed_peak >= committed_before);
            let pages = committed_peak / PlatformVmOps::page_size();
            let per_page = stats.classes[class].units_per_page;
            // Every unit of every page is free again.
            prop_assert_eq!(stats.classes[class].free_units, pages * per_page);
            if committed_peak == committed_before {
                prop_assert_eq!(stats.classes[class].free_units, free_before);
            }
        }
    }
}
