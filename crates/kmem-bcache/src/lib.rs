#![forbid(unsafe_code)]
//! Concurrent disk block buffer cache with sharded LRU buckets.
//!
//! A fixed pool of N buffers holds cached copies of disk block contents.
//! The pool is partitioned into B independent buckets by
//! `block_number mod B`, each bucket owning one short-critical-section
//! lock and a recency-ordered list of its resident buffers. Requests for
//! a `(device, block)` pair find the resident buffer, or recycle the
//! least recently used unreferenced buffer in the home bucket, or steal
//! one from a sibling bucket; the returned buffer is exclusively locked.
//!
//! # Locking
//!
//! - Bucket locks guard identity, reference counts, and list order.
//!   Critical sections never perform device I/O, and no caller ever
//!   holds two bucket locks at once: the steal path releases the source
//!   bucket's lock before taking the destination's, with the victim
//!   already unlinked so no other caller can re-claim it in between.
//! - Each buffer's payload sits behind a [`SleepLock`] that may be held
//!   across a device transfer. [`BufHandle`] owns that lock for its
//!   whole lifetime, so payload access without the lock is
//!   unrepresentable.
//!
//! Cache exhaustion (no unreferenced buffer anywhere) is a fatal
//! invariant violation: the pool size is fixed system configuration,
//! and running out means callers hold too many buffers concurrently.

mod device;
mod metrics;
mod sleeplock;

pub use device::{BlockDevice, FileBlockDevice, MemBlockDevice};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use sleeplock::{SleepLock, SleepLockGuard};

use kmem_error::{KmemError, Result};
use kmem_types::{BlockNumber, CacheConfig, DeviceId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace};

/// Bucket-guarded metadata for one resident buffer.
///
/// `ident` is `None` for a buffer that has never held a block (startup)
/// or whose theft was abandoned (see the steal path); a vacant entry can
/// never satisfy a lookup, only be recycled.
#[derive(Debug, Clone, Copy)]
struct Entry {
    slot: usize,
    ident: Option<(DeviceId, BlockNumber)>,
    ref_count: u32,
}

/// One bucket: resident entries ordered front = most recently used,
/// back = least recently used.
#[derive(Debug, Default)]
struct Bucket {
    entries: VecDeque<Entry>,
}

/// Payload side of one pool slot. Identity and reference count live in
/// the owning bucket; only the validity flag and the payload live here.
#[derive(Debug)]
struct Slot {
    /// Whether the payload reflects on-disk content. Cleared by the
    /// recycle/steal paths while `ref_count` transitions 0→1 under the
    /// bucket lock (no holder can exist), set by the miss-fill path
    /// under the sleep lock.
    valid: AtomicBool,
    frame: SleepLock<Vec<u8>>,
}

/// Sharded buffer cache over a [`BlockDevice`].
pub struct BufferCache<D> {
    device: D,
    config: CacheConfig,
    buckets: Vec<Mutex<Bucket>>,
    slots: Vec<Slot>,
    metrics: CacheMetrics,
}

impl<D: BlockDevice> BufferCache<D> {
    /// Create a cache with `config.buffers()` preallocated buffers over
    /// `config.buckets()` buckets.
    ///
    /// All buffers start vacant in block 0's bucket and disperse across
    /// buckets through the steal path.
    pub fn new(device: D, config: CacheConfig) -> Result<Self> {
        if device.block_size() != config.block_size() {
            return Err(KmemError::Config(format!(
                "device block size {} does not match configured block size {}",
                device.block_size(),
                config.block_size()
            )));
        }
        let payload_len =
            usize::try_from(config.block_size()).expect("block size fits in usize");
        let buckets = (0..config.buckets())
            .map(|_| Mutex::new(Bucket::default()))
            .collect();
        let slots = (0..config.buffers())
            .map(|_| Slot {
                valid: AtomicBool::new(false),
                frame: SleepLock::new(vec![0_u8; payload_len]),
            })
            .collect();
        let cache = Self {
            device,
            config,
            buckets,
            slots,
            metrics: CacheMetrics::default(),
        };
        {
            let mut bucket = cache.buckets[cache.bucket_index(BlockNumber(0))].lock();
            for slot in 0..cache.slots.len() {
                bucket.entries.push_front(Entry {
                    slot,
                    ident: None,
                    ref_count: 0,
                });
            }
        }
        info!(
            buckets = cache.config.buckets(),
            buffers = cache.config.buffers(),
            block_size = cache.config.block_size(),
            "buffer_cache_init"
        );
        Ok(cache)
    }

    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// The underlying device.
    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Return a locked buffer with the contents of the indicated block.
    ///
    /// On a cold buffer this performs one synchronous device transfer;
    /// the error is propagated without retry and the buffer stays
    /// invalid, so a failed fill can never serve stale payload.
    pub fn read(&self, device: DeviceId, block: BlockNumber) -> Result<BufHandle<'_, D>> {
        let mut handle = self.get(device, block);
        if !self.slots[handle.slot].valid.load(Ordering::Acquire) {
            self.device.read_block(device, block, handle.payload_mut())?;
            self.slots[handle.slot].valid.store(true, Ordering::Release);
            self.metrics.record_fill();
        }
        Ok(handle)
    }

    /// Take an extra reference on a resident block so it cannot be
    /// evicted, independent of any held handle.
    ///
    /// # Panics
    /// Panics if the block is not resident — pinning is only meaningful
    /// for a buffer the caller already obtained, so this is a caller
    /// bug.
    pub fn pin(&self, device: DeviceId, block: BlockNumber) {
        let mut bucket = self.buckets[self.bucket_index(block)].lock();
        let entry = bucket
            .entries
            .iter_mut()
            .find(|e| e.ident == Some((device, block)))
            .expect("pin of a block that is not resident");
        entry.ref_count += 1;
    }

    /// Drop a reference taken with [`Self::pin`]. List position is left
    /// untouched.
    ///
    /// # Panics
    /// Panics if the block is not resident or its reference count would
    /// go negative.
    pub fn unpin(&self, device: DeviceId, block: BlockNumber) {
        let mut bucket = self.buckets[self.bucket_index(block)].lock();
        let entry = bucket
            .entries
            .iter_mut()
            .find(|e| e.ident == Some((device, block)))
            .expect("unpin of a block that is not resident");
        entry.ref_count = entry
            .ref_count
            .checked_sub(1)
            .expect("buffer ref_count underflow");
    }

    /// Look up or allocate a buffer for `(device, block)` and lock it.
    fn get(&self, device: DeviceId, block: BlockNumber) -> BufHandle<'_, D> {
        let home = self.bucket_index(block);

        {
            let mut bucket = self.buckets[home].lock();
            if let Some(entry) = bucket
                .entries
                .iter_mut()
                .find(|e| e.ident == Some((device, block)))
            {
                entry.ref_count += 1;
                let slot = entry.slot;
                drop(bucket);
                self.metrics.record_hit();
                trace!(device = device.0, block = block.0, slot, "bcache_hit");
                return self.lock_slot(slot, device, block);
            }

            // Miss: recycle the least recently used unreferenced buffer
            // in the home bucket.
            if let Some(pos) = bucket.entries.iter().rposition(|e| e.ref_count == 0) {
                let entry = &mut bucket.entries[pos];
                entry.ident = Some((device, block));
                entry.ref_count = 1;
                let slot = entry.slot;
                self.slots[slot].valid.store(false, Ordering::Release);
                drop(bucket);
                self.metrics.record_recycle();
                trace!(device = device.0, block = block.0, slot, "bcache_recycle");
                return self.lock_slot(slot, device, block);
            }
        }

        // Home bucket is saturated: probe every other bucket for an
        // unreferenced buffer, holding at most one bucket lock at a
        // time.
        for source in 0..self.buckets.len() {
            if source == home {
                continue;
            }
            let victim = {
                let mut bucket = self.buckets[source].lock();
                let pos = bucket.entries.iter().rposition(|e| e.ref_count == 0);
                pos.and_then(|pos| bucket.entries.remove(pos))
            };
            // The victim was unlinked before the source lock was
            // released, so no other caller can observe or re-claim it.
            let Some(mut victim) = victim else {
                continue;
            };

            let mut bucket = self.buckets[home].lock();
            // The identity may have been inserted by another context
            // while no bucket lock was held; re-scan before inserting.
            if let Some(entry) = bucket
                .entries
                .iter_mut()
                .find(|e| e.ident == Some((device, block)))
            {
                entry.ref_count += 1;
                let slot = entry.slot;
                // Park the stolen buffer as a vacant eviction candidate;
                // vacant entries can never satisfy a lookup, so it
                // cannot shadow the entry we just found.
                victim.ident = None;
                bucket.entries.push_back(victim);
                drop(bucket);
                self.metrics.record_steal_race();
                trace!(device = device.0, block = block.0, slot, "bcache_steal_race");
                return self.lock_slot(slot, device, block);
            }

            victim.ident = Some((device, block));
            victim.ref_count = 1;
            let slot = victim.slot;
            self.slots[slot].valid.store(false, Ordering::Release);
            bucket.entries.push_front(victim);
            drop(bucket);
            self.metrics.record_steal();
            debug!(device = device.0, block = block.0, slot, source, "bcache_steal");
            return self.lock_slot(slot, device, block);
        }

        panic!(
            "buffer cache exhausted: no unreferenced buffer for device {} block {}",
            device.0, block.0
        );
    }

    fn lock_slot(&self, slot: usize, device: DeviceId, block: BlockNumber) -> BufHandle<'_, D> {
        let guard = self.slots[slot].frame.lock();
        BufHandle {
            cache: self,
            slot,
            device,
            block,
            guard: Some(guard),
        }
    }

    /// Give up one reference; at zero, move the buffer to the
    /// most-recently-used position of its bucket so recency is tracked
    /// even while idle.
    fn release_slot(&self, slot: usize, device: DeviceId, block: BlockNumber) {
        let mut bucket = self.buckets[self.bucket_index(block)].lock();
        let pos = bucket
            .entries
            .iter()
            .position(|e| e.slot == slot)
            .expect("released buffer must be resident in its home bucket");
        let entry = &mut bucket.entries[pos];
        assert!(
            entry.ident == Some((device, block)),
            "released buffer identity changed while referenced"
        );
        entry.ref_count = entry
            .ref_count
            .checked_sub(1)
            .expect("buffer ref_count underflow");
        if entry.ref_count == 0 {
            let entry = bucket.entries.remove(pos).expect("position is in range");
            bucket.entries.push_front(entry);
        }
    }

    #[inline]
    fn bucket_index(&self, block: BlockNumber) -> usize {
        let count = u64::try_from(self.buckets.len()).expect("bucket count fits in u64");
        usize::try_from(block.0 % count).expect("remainder fits in usize")
    }
}

impl<D> std::fmt::Debug for BufferCache<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("buckets", &self.buckets.len())
            .field("buffers", &self.slots.len())
            .finish_non_exhaustive()
    }
}

// ── Buffer handle ───────────────────────────────────────────────────────────

/// Exclusively locked buffer.
///
/// Owns the slot's sleep lock for its whole lifetime and dereferences to
/// the payload bytes. Dropping the handle releases the lock first and
/// then gives up the reference under the bucket lock.
pub struct BufHandle<'a, D: BlockDevice> {
    cache: &'a BufferCache<D>,
    slot: usize,
    device: DeviceId,
    block: BlockNumber,
    guard: Option<SleepLockGuard<'a, Vec<u8>>>,
}

impl<D: BlockDevice> BufHandle<'_, D> {
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Index of the pool slot backing this buffer. Diagnostic identity:
    /// two handles for the same `(device, block)` always report the
    /// same slot.
    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.slot
    }

    /// Write the payload to the device. The exclusive lock is held by
    /// construction, so the transfer cannot interleave with payload
    /// mutation. Does not release the lock or alter cache membership.
    pub fn write(&self) -> Result<()> {
        self.cache
            .device
            .write_block(self.device, self.block, self.payload())
    }

    fn payload(&self) -> &[u8] {
        self.guard.as_ref().expect("payload guard held").as_slice()
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        self.guard
            .as_mut()
            .expect("payload guard held")
            .as_mut_slice()
    }
}

impl<D: BlockDevice> Deref for BufHandle<'_, D> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.payload()
    }
}

impl<D: BlockDevice> DerefMut for BufHandle<'_, D> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.payload_mut()
    }
}

impl<D: BlockDevice> Drop for BufHandle<'_, D> {
    fn drop(&mut self) {
        // Release the exclusive lock before touching bucket state; no
        // caller ever holds a bucket lock and a sleep lock together.
        self.guard = None;
        self.cache.release_slot(self.slot, self.device, self.block);
    }
}

impl<D: BlockDevice> std::fmt::Debug for BufHandle<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufHandle")
            .field("device", &self.device)
            .field("block", &self.block)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
