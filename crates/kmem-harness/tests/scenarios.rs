#![forbid(unsafe_code)]
//! End-to-end scenarios exercising the cache and allocator through
//! their public surfaces only.

use kmem_bcache::{BufferCache, MemBlockDevice};
use kmem_error::KmemError;
use kmem_palloc::{FixedCoreHint, PageAllocator};
use kmem_types::{
    ALLOC_FILL, BlockNumber, CacheConfig, CoreId, DeviceId, MemoryLayout, PageAddr,
};

fn small_cache() -> BufferCache<MemBlockDevice> {
    let device = MemBlockDevice::new(512, 64).expect("device");
    let config = CacheConfig::new(2, 4, 512).expect("config");
    BufferCache::new(device, config).expect("cache")
}

/// Two buckets, four buffers: hold blocks 0..=3, release one, and the
/// fifth distinct block must succeed by stealing across buckets.
#[test]
fn saturated_cache_steals_across_buckets() {
    let cache = small_cache();
    let dev = DeviceId(0);

    let _b0 = cache.read(dev, BlockNumber(0)).expect("read 0");
    let _b1 = cache.read(dev, BlockNumber(1)).expect("read 1");
    let _b2 = cache.read(dev, BlockNumber(2)).expect("read 2");
    let b3 = cache.read(dev, BlockNumber(3)).expect("read 3");

    // Release one buffer in bucket 1; block 4's home bucket 0 is still
    // fully referenced, so the request must steal from bucket 1.
    drop(b3);
    let b4 = cache.read(dev, BlockNumber(4)).expect("read 4");
    assert_eq!(b4.block(), BlockNumber(4));
    assert!(cache.metrics().snapshot().steals >= 1);
}

/// Same setup with every buffer held: the fifth distinct block has
/// nowhere to go, which is a fatal pool-size violation.
#[test]
#[should_panic(expected = "no unreferenced buffer")]
fn saturated_cache_with_all_buffers_held_is_fatal() {
    let cache = small_cache();
    let dev = DeviceId(0);

    let _held: Vec<_> = (0..4)
        .map(|n| cache.read(dev, BlockNumber(n)).expect("read"))
        .collect();
    let _ = cache.read(dev, BlockNumber(4));
}

/// Four lists of ten pages each: drain list 0 through its preferred
/// hint, then the next allocation steals from list 3's original range.
#[test]
fn drained_list_steals_from_the_highest_sibling() {
    let layout = MemoryLayout::new(PageAddr(0x8000_0000), 4096, 40, 4).expect("layout");
    let pool = PageAllocator::with_core_hint(layout, Box::new(FixedCoreHint(CoreId(0))));

    let mut drained = Vec::new();
    for _ in 0..10 {
        let addr = pool.alloc().expect("alloc from list 0");
        let index = layout.index_of(addr).expect("managed address");
        assert!(layout.quota_range(0).contains(&index));
        drained.push(addr);
    }

    let stolen = pool.alloc().expect("steal");
    let index = layout.index_of(stolen).expect("managed address");
    assert!(
        layout.quota_range(3).contains(&index),
        "steal came from list {} instead of list 3",
        layout.seeded_list_of(index)
    );
}

/// The allocator and the cache compose: pages serve as staging memory
/// for block payloads, and the documented fill bytes make stale reuse
/// visible at every step.
#[test]
fn pages_stage_block_payloads() {
    let layout = MemoryLayout::new(PageAddr(0x8000_0000), 4096, 8, 2).expect("layout");
    let pool = PageAllocator::with_core_hint(layout, Box::new(FixedCoreHint(CoreId(0))));

    let device = MemBlockDevice::new(1024, 16).expect("device");
    let config = CacheConfig::new(2, 4, 1024).expect("config");
    let cache = BufferCache::new(device, config).expect("cache");
    let dev = DeviceId(0);

    let page = pool.alloc().expect("alloc staging page");
    pool.with_page(page, |bytes| {
        assert!(bytes.iter().all(|&b| b == ALLOC_FILL));
    });

    // Stage a payload in the page, then copy it into a cached block and
    // write it through to the device.
    pool.with_page_mut(page, |bytes| bytes[..1024].fill(0x42));
    {
        let mut buf = cache.read(dev, BlockNumber(9)).expect("read");
        pool.with_page(page, |bytes| buf.copy_from_slice(&bytes[..1024]));
        buf.write().expect("write through");
    }
    pool.free(page);

    // The block survives eviction pressure: cycle enough other blocks
    // through the four buffers to evict it, then read it back from the
    // device.
    for n in 0..8 {
        drop(cache.read(dev, BlockNumber(n)).expect("read"));
    }
    let buf = cache.read(dev, BlockNumber(9)).expect("re-read");
    assert!(buf.iter().all(|&b| b == 0x42));
}

/// Exhaustion of the page pool is an error the caller can recover
/// from, unlike cache exhaustion.
#[test]
fn page_exhaustion_recovers_after_free() {
    let layout = MemoryLayout::new(PageAddr(0), 4096, 6, 2).expect("layout");
    let pool = PageAllocator::with_core_hint(layout, Box::new(FixedCoreHint(CoreId(0))));

    let held: Vec<PageAddr> = (0..6).map(|_| pool.alloc().expect("alloc")).collect();
    assert!(matches!(pool.alloc(), Err(KmemError::OutOfPages)));

    pool.free(held[2]);
    let recovered = pool.alloc().expect("alloc after free");
    assert_eq!(recovered, held[2]);
}
