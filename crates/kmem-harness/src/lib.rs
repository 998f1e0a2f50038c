#![forbid(unsafe_code)]
//! Workload drivers for exercising the buffer cache and the page
//! allocator under thread contention, with serializable reports.

use kmem_bcache::{BufferCache, CacheMetricsSnapshot, MemBlockDevice};
use kmem_error::{KmemError, Result};
use kmem_palloc::{AllocatorMetricsSnapshot, PageAllocator};
use kmem_types::{BlockNumber, CacheConfig, DeviceId, MemoryLayout, PageAddr};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};

// ── Cache workload ──────────────────────────────────────────────────────────

/// Shape of a cache stress run.
#[derive(Debug, Clone, Copy)]
pub struct CacheWorkload {
    pub threads: usize,
    pub ops_per_thread: usize,
    /// Working set; should exceed `buffers` to force recycling.
    pub distinct_blocks: u64,
    pub buckets: usize,
    pub buffers: usize,
    /// Write the payload back to the device every n-th operation.
    pub write_every: usize,
}

impl Default for CacheWorkload {
    fn default() -> Self {
        Self {
            threads: 8,
            ops_per_thread: 10_000,
            distinct_blocks: 64,
            buckets: kmem_types::BUCKET_COUNT,
            buffers: kmem_types::BUF_COUNT,
            write_every: 16,
        }
    }
}

/// Outcome of a cache stress run.
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub ops: u64,
    pub device_reads: u64,
    pub device_writes: u64,
    pub metrics: CacheMetricsSnapshot,
}

/// Drive concurrent readers over a shared working set.
///
/// Every operation stamps the payload with the block number and checks
/// that no other block's stamp leaked in, so a residency violation
/// fails loudly instead of skewing counters.
pub fn run_cache_workload(workload: CacheWorkload) -> Result<CacheReport> {
    let device = MemBlockDevice::new(kmem_types::BLOCK_SIZE, workload.distinct_blocks.max(1))?;
    let config = CacheConfig::new(workload.buckets, workload.buffers, kmem_types::BLOCK_SIZE)
        .map_err(|e| KmemError::Config(e.to_string()))?;
    let cache = Arc::new(BufferCache::new(device, config)?);
    let barrier = Arc::new(Barrier::new(workload.threads));
    let ops = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..workload.threads)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let ops = Arc::clone(&ops);
            std::thread::spawn(move || -> Result<()> {
                barrier.wait();
                for i in 0..workload.ops_per_thread {
                    let mixed = u64::try_from(t * workload.ops_per_thread + i)
                        .expect("op counter fits in u64");
                    let block = BlockNumber(mixed.wrapping_mul(0x9e37_79b9) % workload.distinct_blocks);
                    let mut buf = cache.read(DeviceId(0), block)?;

                    let stamp = u8::try_from(block.0 % 251).expect("stamp fits in u8");
                    let first = buf.first().copied().unwrap_or(0);
                    assert!(
                        first == 0 || first == stamp,
                        "foreign payload in block {}: {first:#x}",
                        block.0
                    );
                    buf.fill(stamp);
                    if workload.write_every != 0 && i % workload.write_every == 0 {
                        buf.write()?;
                    }
                    ops.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker thread panicked")?;
    }

    Ok(CacheReport {
        ops: ops.load(Ordering::Relaxed),
        device_reads: cache.device().reads(),
        device_writes: cache.device().writes(),
        metrics: cache.metrics().snapshot(),
    })
}

// ── Allocator workload ──────────────────────────────────────────────────────

/// Shape of an allocator stress run.
#[derive(Debug, Clone, Copy)]
pub struct AllocWorkload {
    pub threads: usize,
    pub ops_per_thread: usize,
    pub pages: usize,
    pub lists: usize,
    /// Pages each thread holds before it starts releasing the oldest.
    pub held_per_thread: usize,
}

impl Default for AllocWorkload {
    fn default() -> Self {
        Self {
            threads: 8,
            ops_per_thread: 10_000,
            pages: 1024,
            lists: kmem_types::FREE_LIST_COUNT,
            held_per_thread: 16,
        }
    }
}

/// Outcome of an allocator stress run.
#[derive(Debug, Clone, Serialize)]
pub struct AllocReport {
    pub ops: u64,
    pub failed_allocs: u64,
    pub free_pages_after: usize,
    pub metrics: AllocatorMetricsSnapshot,
}

/// Drive concurrent allocate/hold/free churn.
///
/// Each thread writes its own tag into every page it holds and checks
/// the tag on free, so a double allocation fails loudly.
pub fn run_alloc_workload(workload: AllocWorkload) -> Result<AllocReport> {
    let layout = MemoryLayout::new(
        PageAddr(0x8000_0000),
        kmem_types::PAGE_SIZE,
        workload.pages,
        workload.lists,
    )
    .map_err(|e| KmemError::Config(e.to_string()))?;
    let pool = Arc::new(PageAllocator::new(layout));
    let barrier = Arc::new(Barrier::new(workload.threads));
    let ops = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..workload.threads)
        .map(|t| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            let ops = Arc::clone(&ops);
            let failed = Arc::clone(&failed);
            std::thread::spawn(move || {
                let tag = u8::try_from(t % 256).expect("tag fits in u8");
                let mut held: Vec<PageAddr> = Vec::with_capacity(workload.held_per_thread);
                barrier.wait();
                for _ in 0..workload.ops_per_thread {
                    if held.len() >= workload.held_per_thread {
                        let addr = held.remove(0);
                        pool.with_page(addr, |bytes| {
                            assert!(
                                bytes.iter().all(|&b| b == tag),
                                "page {:#x} lost its owner's tag",
                                addr.0
                            );
                        });
                        pool.free(addr);
                    }
                    match pool.alloc() {
                        Ok(addr) => {
                            pool.with_page_mut(addr, |bytes| bytes.fill(tag));
                            held.push(addr);
                        }
                        Err(KmemError::OutOfPages) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            // Back off by releasing everything we hold.
                            for addr in held.drain(..) {
                                pool.free(addr);
                            }
                        }
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                    ops.fetch_add(1, Ordering::Relaxed);
                }
                for addr in held.drain(..) {
                    pool.free(addr);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker thread panicked");
    }

    Ok(AllocReport {
        ops: ops.load(Ordering::Relaxed),
        failed_allocs: failed.load(Ordering::Relaxed),
        free_pages_after: pool.free_pages(),
        metrics: pool.metrics(),
    })
}
