//! Cache Pool: the shared per-class buffer between thread pools.
//!
//! Threads spill surplus free units into the cache and starved threads
//! refill from it in bulk, one lock acquisition per batch. The free-unit
//! count is mirrored into an atomic so the allocation path can skip the lock
//! when the cache is near empty.
//!
//! The mirror is read without the lock. Two threads may both see a full
//! cache and race for it; the loser gets zero units and faults in a fresh
//! page. This trades a little memory growth under contention for a lock-free
//! check on every refill decision.

use crate::memory::provider::PageSource;
use crate::memory::unit_pool::{FixedUnitPool, UnitGeometry};
use crate::memory::vm::VmError;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Mutex, MutexGuard, lock};
use log::trace;
use std::ptr::NonNull;

pub(crate) struct CachePool {
    pool: Mutex<FixedUnitPool>,
    free_hint: AtomicUsize,
    geometry: UnitGeometry,
}

impl CachePool {
    pub(crate) fn new(geometry: UnitGeometry) -> Self {
        Self {
            pool: Mutex::new(FixedUnitPool::new(geometry)),
            free_hint: AtomicUsize::new(0),
            geometry,
        }
    }

    #[inline]
    pub(crate) fn geometry(&self) -> &UnitGeometry {
        &self.geometry
    }

    /// Free units last published by a lock holder. May be stale.
    #[inline]
    pub(crate) fn free_hint(&self) -> usize {
        self.free_hint.load(Ordering::Relaxed)
    }

    /// Lock the underlying pool. Call [`publish`](CachePool::publish) before
    /// releasing the guard if the pool changed.
    pub(crate) fn lock(&self) -> MutexGuard<'_, FixedUnitPool> {
        lock(&self.pool)
    }

    pub(crate) fn publish(&self, pool: &FixedUnitPool) {
        self.free_hint.store(pool.free_units(), Ordering::Relaxed);
    }

    /// Move up to `max` units from the cache into `target`. Returns the
    /// number moved, zero if another thread drained the cache first.
    pub(crate) fn refill(&self, target: &mut FixedUnitPool, max: usize) -> usize {
        debug_assert_eq!(target.geometry(), &self.geometry);
        let mut cache = self.lock();
        let Some(chain) = cache.take_chain(max) else {
            return 0;
        };
        let moved = chain.len();
        target.splice_in(chain);
        self.publish(&cache);
        trace!(
            "cache[{}]: refilled thread pool with {moved} units, {} left",
            self.geometry.unit_size,
            cache.free_units()
        );
        moved
    }

    /// Move up to `max` units from `source` into the cache.
    pub(crate) fn absorb(&self, source: &mut FixedUnitPool, max: usize) -> usize {
        debug_assert_eq!(source.geometry(), &self.geometry);
        let Some(chain) = source.take_chain(max) else {
            return 0;
        };
        let moved = chain.len();
        let mut cache = self.lock();
        cache.splice_in(chain);
        self.publish(&cache);
        trace!(
            "cache[{}]: absorbed {moved} units, {} held",
            self.geometry.unit_size,
            cache.free_units()
        );
        moved
    }

    /// Serve a unit straight from the cache. Used by threads without a pool
    /// set (thread-local storage already torn down).
    pub(crate) fn allocate_unit<S: PageSource>(
        &self,
        source: &S,
    ) -> Result<NonNull<u8>, VmError> {
        let mut cache = self.lock();
        let unit = cache.allocate_unit(source)?;
        self.publish(&cache);
        Ok(unit)
    }

    /// Return a unit straight to the cache.
    ///
    /// # Safety
    /// Same contract as [`FixedUnitPool::free_unit`].
    pub(crate) unsafe fn free_unit(&self, unit: NonNull<u8>) {
        let mut cache = self.lock();
        // Safety: forwarded contract.
        unsafe { cache.free_unit(unit) };
        self.publish(&cache);
    }
}
