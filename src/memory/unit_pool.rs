//! Fixed Unit Pool: committed pages carved into equal-size units.
//!
//! Free units form an intrusive singly-linked list. The first word of a free
//! unit holds a [`UnitLink`] naming the next free unit by page number and
//! slot; nothing else of a free unit is ever read. Pools of one size class
//! share a geometry, so units migrate freely between a thread's pool and the
//! shared cache pool.
//!
//! Page reclamation runs in three phases over every pool of a class (see
//! `PoolMultiplexer::decommit_class`):
//!
//! 1. [`pre_decommit`](FixedUnitPool::pre_decommit) counts free units per page.
//! 2. [`reclaim_selection`](FixedUnitPool::reclaim_selection) splices out units
//!    of pages whose count reached `units_per_page`.
//! 3. [`finalize_decommit`](FixedUnitPool::finalize_decommit) returns those
//!    pages and recounts the surviving list.
//!
//! A corrupted or cyclic list is detected by walking more nodes than the pool
//! claims to hold, and is fatal.

use crate::memory::bookkeeping_corrupted;
use crate::memory::provider::PageSource;
use crate::memory::vm::VmError;
use log::trace;
use std::collections::HashMap;
use std::ptr::NonNull;

/// Byte pattern written over unit payloads in debug builds.
pub(crate) const POISON: u8 = 0xAC;

const SLOT_BITS: u32 = 16;
const SLOT_MASK: usize = (1 << SLOT_BITS) - 1;

/// Free-counter table shared by every pool of one class during decommit,
/// keyed by page number.
pub(crate) type PageCounts = HashMap<usize, usize>;

/// Encoded free-list link: `page_number << 16 | (slot + 1)`, 0 is the end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct UnitLink(usize);

impl UnitLink {
    pub(crate) const END: Self = Self(0);

    #[inline]
    pub(crate) fn is_end(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub(crate) fn page_number(self) -> usize {
        self.0 >> SLOT_BITS
    }

    #[inline]
    fn slot(self) -> usize {
        (self.0 & SLOT_MASK) - 1
    }
}

/// Layout shared by every pool of one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct UnitGeometry {
    pub(crate) unit_size: usize,
    pub(crate) page_size: usize,
    pub(crate) units_per_page: usize,
}

impl UnitGeometry {
    pub(crate) fn new(unit_size: usize, page_size: usize) -> Result<Self, VmError> {
        if unit_size < size_of::<usize>() || unit_size % align_of::<usize>() != 0 {
            return Err(VmError::InitializationFailed(format!(
                "unit size {unit_size} cannot hold an aligned free-list link"
            )));
        }
        let units_per_page = page_size / unit_size;
        if units_per_page == 0 || units_per_page > SLOT_MASK {
            return Err(VmError::InitializationFailed(format!(
                "{units_per_page} units of {unit_size} bytes per {page_size} byte page"
            )));
        }
        Ok(Self {
            unit_size,
            page_size,
            units_per_page,
        })
    }

    #[inline]
    fn link_of(&self, unit: NonNull<u8>) -> UnitLink {
        let addr = unit.as_ptr().expose_provenance();
        let page_number = addr / self.page_size;
        let offset = addr % self.page_size;
        debug_assert_eq!(offset % self.unit_size, 0, "{unit:p} is not a unit boundary");
        let slot = offset / self.unit_size;
        debug_assert!(slot < self.units_per_page, "{unit:p} lies in a page tail");
        UnitLink(page_number << SLOT_BITS | (slot + 1))
    }

    /// Decode a non-end link into the unit it names.
    #[inline]
    fn unit_of(&self, link: UnitLink) -> NonNull<u8> {
        assert!(!link.is_end(), "decoding the end-of-list link");
        let slot = link.slot();
        if cfg!(debug_assertions) && slot >= self.units_per_page {
            bookkeeping_corrupted(format_args!(
                "free-list slot {slot} out of range (page holds {})",
                self.units_per_page
            ));
        }
        let addr = link.page_number() * self.page_size + slot * self.unit_size;
        let ptr = std::ptr::with_exposed_provenance_mut::<u8>(addr);
        match NonNull::new(ptr) {
            Some(unit) => unit,
            None => {
                bookkeeping_corrupted(format_args!("free-list link {link:?} decodes to null"))
            }
        }
    }

    #[inline]
    fn page_number_of(&self, page: NonNull<u8>) -> usize {
        page.as_ptr().addr() / self.page_size
    }
}

/// A run of free units detached from one pool, ready to splice into another.
pub(crate) struct UnitChain {
    head: UnitLink,
    tail: NonNull<u8>,
    len: usize,
}

impl UnitChain {
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) allocated: u64,
    pub(crate) freed: u64,
    /// High-water mark of `allocated - freed` for this pool alone.
    pub(crate) peak_live: u64,
}

pub(crate) struct FixedUnitPool {
    geometry: UnitGeometry,
    head: UnitLink,
    free_units: usize,
    pages: Vec<NonNull<u8>>,
    counters: PoolCounters,
}

// Safety: the pool exclusively owns the pages in `pages` and the free units
// reachable from `head`; every access goes through `&mut self` behind the
// owner's mutex.
unsafe impl Send for FixedUnitPool {}

impl FixedUnitPool {
    pub(crate) fn new(geometry: UnitGeometry) -> Self {
        Self {
            geometry,
            head: UnitLink::END,
            free_units: 0,
            pages: Vec::new(),
            counters: PoolCounters::default(),
        }
    }

    #[inline]
    pub(crate) fn geometry(&self) -> &UnitGeometry {
        &self.geometry
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_end()
    }

    #[inline]
    pub(crate) fn free_units(&self) -> usize {
        self.free_units
    }

    pub(crate) fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn counters(&self) -> PoolCounters {
        self.counters
    }

    #[inline]
    fn read_link(&self, unit: NonNull<u8>) -> UnitLink {
        // Safety: `unit` is a free unit of a committed page; its first word
        // holds the link.
        UnitLink(unsafe { unit.as_ptr().cast::<usize>().read() })
    }

    #[inline]
    fn write_link(&self, unit: NonNull<u8>, link: UnitLink) {
        // Safety: `unit` is a unit this pool may write (free, or being
        // pushed); it is word aligned and at least one word long.
        unsafe { unit.as_ptr().cast::<usize>().write(link.0) }
    }

    /// Fault in a fresh page and thread all its units onto the list.
    fn prepare_page<S: PageSource>(&mut self, source: &S) -> Result<(), VmError> {
        debug_assert_eq!(source.page_size(), self.geometry.page_size);
        let page = source.allocate_page()?;

        if cfg!(debug_assertions) {
            // Safety: the page was just committed for us.
            unsafe { std::ptr::write_bytes(page.as_ptr(), POISON, self.geometry.page_size) };
        }

        let UnitGeometry {
            unit_size,
            units_per_page,
            ..
        } = self.geometry;
        // Link back to front so the list ends up in address order.
        let mut next = self.head;
        for slot in (0..units_per_page).rev() {
            // Safety: slot < units_per_page keeps the unit inside the page.
            let unit = unsafe { page.add(slot * unit_size) };
            self.write_link(unit, next);
            next = self.geometry.link_of(unit);
        }
        self.head = next;
        self.free_units += units_per_page;
        self.pages.push(page);
        trace!(
            "pool[{unit_size}]: page {page:p} prepared, {} pages",
            self.pages.len()
        );
        Ok(())
    }

    /// Pop the free-list head, faulting in a page first if the list is empty.
    pub(crate) fn allocate_unit<S: PageSource>(
        &mut self,
        source: &S,
    ) -> Result<NonNull<u8>, VmError> {
        if self.head.is_end() {
            self.prepare_page(source)?;
        }
        let unit = self.geometry.unit_of(self.head);
        self.head = self.read_link(unit);
        self.free_units -= 1;
        let counters = &mut self.counters;
        counters.allocated += 1;
        counters.peak_live = counters
            .peak_live
            .max(counters.allocated.saturating_sub(counters.freed));
        Ok(unit)
    }

    /// Push `unit` onto the free list.
    ///
    /// # Safety
    /// `unit` must be a unit of this class's geometry on a committed page
    /// owned by some pool of the class, and must not be on any free list.
    pub(crate) unsafe fn free_unit(&mut self, unit: NonNull<u8>) {
        let link = self.geometry.link_of(unit);
        debug_assert_ne!(link, self.head, "double free of unit {unit:p}");

        if cfg!(debug_assertions) {
            // Safety: the unit is ours again; bytes past the link word are payload.
            unsafe {
                std::ptr::write_bytes(
                    unit.as_ptr().add(size_of::<usize>()),
                    POISON,
                    self.geometry.unit_size - size_of::<usize>(),
                );
            }
        }

        self.write_link(unit, self.head);
        self.head = link;
        self.free_units += 1;
        self.counters.freed += 1;
    }

    /// Detach up to `max` units from the head of the list.
    pub(crate) fn take_chain(&mut self, max: usize) -> Option<UnitChain> {
        if max == 0 || self.head.is_end() {
            return None;
        }
        let head = self.head;
        let mut tail = self.geometry.unit_of(head);
        let mut len = 1;
        let mut next = self.read_link(tail);
        while len < max && !next.is_end() {
            tail = self.geometry.unit_of(next);
            next = self.read_link(tail);
            len += 1;
            if len > self.free_units {
                bookkeeping_corrupted(format_args!(
                    "free list of unit size {} holds more than the {} units counted",
                    self.geometry.unit_size, self.free_units
                ));
            }
        }
        self.write_link(tail, UnitLink::END);
        self.head = next;
        self.free_units -= len;
        Some(UnitChain { head, tail, len })
    }

    /// Prepend a chain detached from another pool of the same class.
    pub(crate) fn splice_in(&mut self, chain: UnitChain) {
        self.write_link(chain.tail, self.head);
        self.head = chain.head;
        self.free_units += chain.len;
    }

    /// Walk the list and call `visit` with every link after the head.
    fn walk_after_head(&self, mut visit: impl FnMut(UnitLink, NonNull<u8>)) {
        if self.head.is_end() {
            return;
        }
        let mut cursor = self.read_link(self.geometry.unit_of(self.head));
        let mut seen = 1;
        while !cursor.is_end() {
            seen += 1;
            if seen > self.free_units {
                bookkeeping_corrupted(format_args!(
                    "free list of unit size {} is corrupted or cyclic",
                    self.geometry.unit_size
                ));
            }
            let unit = self.geometry.unit_of(cursor);
            // Read before visiting: the visitor may relink `unit`.
            let next = self.read_link(unit);
            visit(cursor, unit);
            cursor = next;
        }
    }

    /// Phase 1: count free units per page. The head unit is skipped, so the
    /// page being allocated from never looks wholly free.
    pub(crate) fn pre_decommit(&self, counts: &mut PageCounts) {
        let full = self.geometry.units_per_page;
        self.walk_after_head(|link, _| {
            let count = counts.entry(link.page_number()).or_insert(0);
            *count += 1;
            if *count > full {
                bookkeeping_corrupted(format_args!(
                    "page {:#x} has more than {full} free units of size {}",
                    link.page_number(),
                    self.geometry.unit_size
                ));
            }
        });
    }

    /// Phase 2: splice out every unit whose page is wholly free.
    pub(crate) fn reclaim_selection(&mut self, counts: &PageCounts) {
        if self.head.is_end() {
            return;
        }
        let full = self.geometry.units_per_page;
        // The head page was never counted, so the head always survives.
        let mut last = self.geometry.unit_of(self.head);
        let mut spliced = 0usize;
        self.walk_after_head(|link, unit| {
            if counts.get(&link.page_number()) == Some(&full) {
                spliced += 1;
            } else {
                self.write_link(last, link);
                last = unit;
            }
        });
        self.write_link(last, UnitLink::END);
        self.free_units -= spliced;
    }

    /// Phase 3: return wholly free pages to `source` and recount the list.
    /// Returns the number of pages released.
    ///
    /// # Safety
    /// Phase 2 must have run with the same `counts` on every pool of this
    /// class, with no allocation or free in between, so no list still
    /// reaches into a released page.
    pub(crate) unsafe fn finalize_decommit<S: PageSource>(
        &mut self,
        counts: &PageCounts,
        source: &S,
    ) -> usize {
        let full = self.geometry.units_per_page;
        let geometry = self.geometry;
        let before = self.pages.len();
        self.pages.retain(|&page| {
            if counts.get(&geometry.page_number_of(page)) == Some(&full) {
                // Safety: every unit of the page is free and unlinked.
                unsafe { source.free_page(page) };
                false
            } else {
                true
            }
        });
        let released = before - self.pages.len();
        self.free_units = self.count_free();
        if released > 0 {
            trace!(
                "pool[{}]: released {released} pages, {} remain, {} units free",
                geometry.unit_size,
                self.pages.len(),
                self.free_units
            );
        }
        released
    }

    fn count_free(&self) -> usize {
        if self.head.is_end() {
            return 0;
        }
        let mut n = 1;
        self.walk_after_head(|_, _| n += 1);
        n
    }

    /// Return every page to `source`, live units or not.
    ///
    /// # Safety
    /// No unit of any page of this pool may be accessed afterwards, and no
    /// other pool's list may still be walked into these pages.
    pub(crate) unsafe fn release_all_pages<S: PageSource>(&mut self, source: &S) -> usize {
        let released = self.pages.len();
        for page in self.pages.drain(..) {
            // Safety: forwarded contract.
            unsafe { source.free_page(page) };
        }
        self.head = UnitLink::END;
        self.free_units = 0;
        released
    }
}
