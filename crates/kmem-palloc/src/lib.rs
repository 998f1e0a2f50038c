#![forbid(unsafe_code)]
//! Physical page allocator with per-core free lists and stealing.
//!
//! The usable physical range is divided at startup into L contiguous
//! sub-ranges of equal page count (remainder pages go to list 0), one
//! free list per range. Each list owns one short-critical-section lock
//! and a singly linked stack of free pages; forward links live in a
//! fixed side array of per-page link cells, the arena-and-index
//! rendering of a link embedded in the free page itself.
//!
//! Allocation pops from the list preferred by the current execution
//! context and falls back to stealing from the other lists in a fixed
//! order (highest index down to 0, skipping the preferred list), so an
//! allocation succeeds whenever any list has capacity. Frees push onto
//! the caller's preferred list at the moment of the call; lists are not
//! ownership-tagged per page.
//!
//! Every transition overwrites the page: freed pages are filled with
//! [`FREED_FILL`] so dangling references read junk, allocated pages
//! with [`ALLOC_FILL`] so uninitialized reads are visibly wrong.
//!
//! Exhaustion is the one recoverable failure
//! ([`KmemError::OutOfPages`]); freeing a misaligned or out-of-range
//! address is a fatal caller bug.

mod core_hint;
mod metrics;

pub use core_hint::{CoreHint, FixedCoreHint, ThreadCoreHint};
pub use metrics::{AllocatorMetricsSnapshot, ListMetrics, ListMetricsSnapshot};

use kmem_error::{KmemError, Result};
use kmem_types::{ALLOC_FILL, CoreId, FREED_FILL, MemoryLayout, PageAddr};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, trace};

/// Sentinel link value marking the end of a free stack.
const NIL: usize = usize::MAX;

/// One free list: stack head plus its length.
#[derive(Debug, Default)]
struct FreeList {
    head: Option<usize>,
    len: usize,
}

/// Page allocator over an owned page-frame arena.
pub struct PageAllocator {
    layout: MemoryLayout,
    hint: Box<dyn CoreHint>,
    lists: Vec<Mutex<FreeList>>,
    /// Per-page forward links. Only read and written under the lock of
    /// the list a page is currently on; the mutex provides the
    /// ordering, so relaxed access suffices.
    links: Vec<AtomicUsize>,
    /// Page contents (the RAM this allocator manages). The per-frame
    /// mutex is an access seam for hosts and tests; the allocator does
    /// no payload-level ownership tracking — exclusive use after
    /// allocation is a caller convention.
    frames: Vec<Mutex<Box<[u8]>>>,
    metrics: Vec<ListMetrics>,
}

impl PageAllocator {
    /// Create an allocator with every page seeded onto its partition's
    /// list, using the default thread-derived core hint.
    #[must_use]
    pub fn new(layout: MemoryLayout) -> Self {
        Self::with_core_hint(layout, Box::new(ThreadCoreHint))
    }

    /// As [`Self::new`] with an explicit core-hint source.
    #[must_use]
    pub fn with_core_hint(layout: MemoryLayout, hint: Box<dyn CoreHint>) -> Self {
        let mut pool = Self::unseeded(layout, hint);
        for list in 0..layout.lists() {
            for index in layout.quota_range(list) {
                pool.seed_page(list, layout.addr_of(index));
            }
        }
        for index in layout.remainder_range() {
            pool.seed_page(0, layout.addr_of(index));
        }
        pool
    }

    /// Create an allocator with every list empty. Combine with
    /// [`Self::seed_page`] to build custom partitions.
    #[must_use]
    pub fn unseeded(layout: MemoryLayout, hint: Box<dyn CoreHint>) -> Self {
        let frame_len = usize::try_from(layout.page_size()).expect("page size fits in usize");
        let pool = Self {
            layout,
            hint,
            lists: (0..layout.lists())
                .map(|_| Mutex::new(FreeList::default()))
                .collect(),
            links: (0..layout.pages()).map(|_| AtomicUsize::new(NIL)).collect(),
            frames: (0..layout.pages())
                .map(|_| Mutex::new(vec![0_u8; frame_len].into_boxed_slice()))
                .collect(),
            metrics: (0..layout.lists()).map(|_| ListMetrics::default()).collect(),
        };
        info!(
            lists = layout.lists(),
            pages = layout.pages(),
            page_size = layout.page_size(),
            "page_allocator_init"
        );
        pool
    }

    /// Startup-only seeding: fill the page at `addr` with the freed
    /// fill byte and push it onto `list`.
    ///
    /// Takes `&mut self` — seeding runs before concurrency starts, so
    /// no locking is possible or needed.
    ///
    /// # Panics
    /// Panics if `list` is out of range or `addr` is misaligned or
    /// outside the managed range (caller bugs).
    pub fn seed_page(&mut self, list: usize, addr: PageAddr) {
        assert!(
            list < self.lists.len(),
            "free list index {list} out of range"
        );
        let index = self.checked_index(addr);
        self.frames[index].get_mut().fill(FREED_FILL);
        let free_list = self.lists[list].get_mut();
        *self.links[index].get_mut() = free_list.head.unwrap_or(NIL);
        free_list.head = Some(index);
        free_list.len += 1;
    }

    /// Allocate one page, preferring the current context's list.
    ///
    /// Returns the page's physical address; its contents are filled
    /// with [`ALLOC_FILL`]. Fails with [`KmemError::OutOfPages`] only
    /// when every list is empty.
    pub fn alloc(&self) -> Result<PageAddr> {
        self.alloc_on(self.hint.current_core())
    }

    /// As [`Self::alloc`] with an explicit context identity.
    pub fn alloc_on(&self, core: CoreId) -> Result<PageAddr> {
        let preferred = self.list_of(core);
        let index = if let Some(index) = self.pop(preferred) {
            self.metrics[preferred].record_alloc();
            trace!(list = preferred, page = index, "page_alloc");
            index
        } else {
            let Some((index, source)) = self.steal(preferred) else {
                debug!(preferred, "page_alloc_exhausted");
                return Err(KmemError::OutOfPages);
            };
            self.metrics[source].record_alloc();
            self.metrics[source].record_stolen_from();
            self.metrics[preferred].record_stolen_to();
            debug!(preferred, source, page = index, "page_steal");
            index
        };
        self.frames[index].lock().fill(ALLOC_FILL);
        Ok(self.layout.addr_of(index))
    }

    /// Free one page, returning it to the current context's list.
    ///
    /// The page must have come from [`Self::alloc`] and must not be
    /// freed twice; the allocator trusts its callers on that, exactly
    /// as it trusts them not to use the page afterwards.
    ///
    /// # Panics
    /// Panics if `addr` is misaligned or outside the managed range.
    pub fn free(&self, addr: PageAddr) {
        self.free_on(self.hint.current_core(), addr);
    }

    /// As [`Self::free`] with an explicit context identity.
    pub fn free_on(&self, core: CoreId, addr: PageAddr) {
        let index = self.checked_index(addr);
        self.frames[index].lock().fill(FREED_FILL);
        let list = self.list_of(core);
        self.push(list, index);
        self.metrics[list].record_free();
        trace!(list, page = index, "page_free");
    }

    /// Run `f` over the page's contents.
    ///
    /// # Panics
    /// Panics if `addr` is misaligned or outside the managed range.
    pub fn with_page<R>(&self, addr: PageAddr, f: impl FnOnce(&[u8]) -> R) -> R {
        let index = self.checked_index(addr);
        let frame = self.frames[index].lock();
        f(&frame)
    }

    /// Run `f` over the page's contents, mutably.
    ///
    /// # Panics
    /// Panics if `addr` is misaligned or outside the managed range.
    pub fn with_page_mut<R>(&self, addr: PageAddr, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let index = self.checked_index(addr);
        let mut frame = self.frames[index].lock();
        f(&mut frame)
    }

    #[must_use]
    pub fn layout(&self) -> MemoryLayout {
        self.layout
    }

    /// Free pages currently on `list`.
    #[must_use]
    pub fn list_len(&self, list: usize) -> usize {
        self.lists[list].lock().len
    }

    /// Free pages across all lists.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        (0..self.lists.len()).map(|list| self.list_len(list)).sum()
    }

    /// Snapshot the per-list counters.
    #[must_use]
    pub fn metrics(&self) -> AllocatorMetricsSnapshot {
        AllocatorMetricsSnapshot::from_lists(
            self.metrics.iter().map(ListMetrics::snapshot).collect(),
        )
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn pop(&self, list: usize) -> Option<usize> {
        let mut guard = self.lists[list].lock();
        let head = guard.head?;
        let next = self.links[head].load(Ordering::Relaxed);
        guard.head = (next != NIL).then_some(next);
        guard.len -= 1;
        Some(head)
    }

    fn push(&self, list: usize, index: usize) {
        let mut guard = self.lists[list].lock();
        self.links[index].store(guard.head.unwrap_or(NIL), Ordering::Relaxed);
        guard.head = Some(index);
        guard.len += 1;
    }

    /// Pop from the first non-empty list in the fixed preference order:
    /// highest index down to 0, skipping the preferred list.
    fn steal(&self, preferred: usize) -> Option<(usize, usize)> {
        for source in (0..self.lists.len()).rev() {
            if source == preferred {
                continue;
            }
            if let Some(index) = self.pop(source) {
                return Some((index, source));
            }
        }
        None
    }

    #[inline]
    fn list_of(&self, core: CoreId) -> usize {
        usize::try_from(core.0).expect("core id fits in usize") % self.lists.len()
    }

    fn checked_index(&self, addr: PageAddr) -> usize {
        self.layout.index_of(addr).unwrap_or_else(|| {
            panic!(
                "page address {:#x} is misaligned or outside the managed range",
                addr.0
            )
        })
    }
}

impl std::fmt::Debug for PageAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageAllocator")
            .field("layout", &self.layout)
            .field("free_pages", &self.free_pages())
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn make_pool(pages: usize, lists: usize) -> PageAllocator {
        let layout =
            MemoryLayout::new(PageAddr(0x8000_0000), 4096, pages, lists).expect("layout");
        PageAllocator::with_core_hint(layout, Box::new(FixedCoreHint(CoreId(0))))
    }

    #[test]
    fn seeding_partitions_with_remainder_to_list_zero() {
        let pool = make_pool(42, 4);
        assert_eq!(pool.list_len(0), 12);
        assert_eq!(pool.list_len(1), 10);
        assert_eq!(pool.list_len(2), 10);
        assert_eq!(pool.list_len(3), 10);
        assert_eq!(pool.free_pages(), 42);
    }

    #[test]
    fn round_trip_reuses_the_address_and_refills() {
        let pool = make_pool(8, 2);

        let addr = pool.alloc().expect("alloc");
        pool.with_page(addr, |bytes| {
            assert!(bytes.iter().all(|&b| b == ALLOC_FILL));
        });

        // Scribble over the page, then free it: the freed fill must
        // clobber the scribble so stale reuse is detectable.
        pool.with_page_mut(addr, |bytes| bytes.fill(0xEE));
        pool.free(addr);
        pool.with_page(addr, |bytes| {
            assert!(bytes.iter().all(|&b| b == FREED_FILL));
        });

        // LIFO: the very next allocation returns the same page, freshly
        // filled with the allocated pattern.
        let again = pool.alloc().expect("alloc");
        assert_eq!(again, addr);
        pool.with_page(again, |bytes| {
            assert!(bytes.iter().all(|&b| b == ALLOC_FILL));
        });
    }

    #[test]
    fn drained_preferred_list_steals_from_highest_first() {
        let pool = make_pool(40, 4);
        let layout = pool.layout();

        // Drain list 0 through its preferred hint.
        for _ in 0..10 {
            let addr = pool.alloc_on(CoreId(0)).expect("alloc");
            let index = layout.index_of(addr).expect("managed address");
            assert!(layout.quota_range(0).contains(&index));
        }
        assert_eq!(pool.list_len(0), 0);

        // The next allocation must come from list 3's original range.
        let stolen = pool.alloc_on(CoreId(0)).expect("steal");
        let index = layout.index_of(stolen).expect("managed address");
        assert!(layout.quota_range(3).contains(&index));

        let snap = pool.metrics();
        assert_eq!(snap.total_steals, 1);
        assert_eq!(snap.per_list[0].stolen_to, 1);
        assert_eq!(snap.per_list[3].stolen_from, 1);
    }

    #[test]
    fn exhaustion_is_an_error_not_a_panic() {
        let pool = make_pool(4, 2);
        let pages: Vec<PageAddr> = (0..4).map(|_| pool.alloc().expect("alloc")).collect();
        assert!(matches!(pool.alloc(), Err(KmemError::OutOfPages)));

        pool.free(pages[0]);
        assert!(pool.alloc().is_ok());
    }

    #[test]
    fn free_lands_on_the_hinted_list() {
        let pool = make_pool(4, 2);
        let addr = pool.alloc_on(CoreId(0)).expect("alloc");
        assert_eq!(pool.list_len(0), 1);
        assert_eq!(pool.list_len(1), 2);

        // Freed from a context on core 1: the page changes lists.
        pool.free_on(CoreId(1), addr);
        assert_eq!(pool.list_len(0), 1);
        assert_eq!(pool.list_len(1), 3);
    }

    #[test]
    #[should_panic(expected = "misaligned or outside")]
    fn misaligned_free_is_fatal() {
        let pool = make_pool(4, 2);
        pool.free(PageAddr(0x8000_0001));
    }

    #[test]
    #[should_panic(expected = "misaligned or outside")]
    fn out_of_range_free_is_fatal() {
        let pool = make_pool(4, 2);
        pool.free(pool.layout().end());
    }

    #[test]
    fn unseeded_pool_fills_via_seed_page() {
        let layout = MemoryLayout::new(PageAddr(0), 4096, 6, 2).expect("layout");
        let mut pool = PageAllocator::unseeded(layout, Box::new(FixedCoreHint(CoreId(1))));
        assert_eq!(pool.free_pages(), 0);
        assert!(matches!(pool.alloc(), Err(KmemError::OutOfPages)));

        // Seed two pages onto list 1 only.
        pool.seed_page(1, layout.addr_of(4));
        pool.seed_page(1, layout.addr_of(5));
        assert_eq!(pool.list_len(0), 0);
        assert_eq!(pool.list_len(1), 2);

        // Preferred hint is core 1 → list 1; stack order is LIFO.
        assert_eq!(pool.alloc().expect("alloc"), layout.addr_of(5));
        assert_eq!(pool.alloc().expect("alloc"), layout.addr_of(4));
    }

    #[test]
    fn concurrent_churn_conserves_the_pool() {
        let layout = MemoryLayout::new(PageAddr(0), 4096, 64, 4).expect("layout");
        let pool = Arc::new(PageAllocator::new(layout));
        let num_threads = 8_usize;
        let rounds = 500_usize;
        let barrier = Arc::new(Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let tag = u8::try_from(t).expect("thread id fits in u8");
                    barrier.wait();
                    for _ in 0..rounds {
                        match pool.alloc() {
                            Ok(addr) => {
                                // Exclusive use: our tag must survive
                                // until we free the page.
                                pool.with_page_mut(addr, |bytes| bytes.fill(tag));
                                pool.with_page(addr, |bytes| {
                                    assert!(bytes.iter().all(|&b| b == tag));
                                });
                                pool.free(addr);
                            }
                            Err(KmemError::OutOfPages) => {
                                // Acceptable under contention.
                            }
                            Err(other) => panic!("unexpected error: {other}"),
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread panicked");
        }

        // Every page came back.
        assert_eq!(pool.free_pages(), 64);
        let snap = pool.metrics();
        assert_eq!(snap.total_allocs, snap.total_frees);
    }
}
